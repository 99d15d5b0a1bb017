//! The bundled logger service: a [`NativeModule`](crate::module::NativeModule) that forwards
//! every text message it receives to `tracing`, and reopens its log file (if configured) on
//! the internal system message the timer thread sends after `SIGHUP`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::info;

use crate::api::ServiceApi;
use crate::handle::Handle;
use crate::message::MessageType;
use crate::module::{Instance, Module};

struct LoggerState {
    path: Option<String>,
    file: Option<File>,
}

/// Bundled logger module. When `path` is `None`, every message is forwarded to `tracing`'s
/// `info!`; when set, lines are also appended to the file, which is reopened whenever a
/// `MessageType::System` message arrives (the timer thread's SIGHUP forwarding path).
pub struct LoggerModule {
    path: Option<String>,
}

impl LoggerModule {
    pub fn new(path: Option<String>) -> Self {
        LoggerModule { path }
    }

    fn open(path: &str) -> Option<File> {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::error!(path, error = %e, "logger failed to open log file");
                None
            }
        }
    }
}

impl Module for LoggerModule {
    fn name(&self) -> &str {
        "logger"
    }

    fn create(&self) -> Instance {
        let file = self.path.as_deref().and_then(Self::open);
        Box::new(Arc::new(StdMutex::new(LoggerState { path: self.path.clone(), file })))
    }

    fn init(&self, instance: &mut Instance, api: &dyn ServiceApi, _args: &str) -> bool {
        let state = instance
            .downcast_ref::<Arc<StdMutex<LoggerState>>>()
            .expect("logger instance")
            .clone();
        api.set_callback(Box::new(move |_api, type_, _session, source, payload| {
            let mut state = state.lock().unwrap();
            if matches!(type_, MessageType::System) {
                if let Some(path) = state.path.clone() {
                    state.file = Self::open(&path);
                    info!(path, "log file reopened");
                }
                return true;
            }

            let text = payload.map(String::from_utf8_lossy).unwrap_or_default();
            info!(%source, "{text}");
            if let Some(file) = state.file.as_mut() {
                let _ = writeln!(file, "[{source}] {text}");
            }
            true
        }));
        true
    }

    fn release(&self, _instance: &mut Instance, _handle: Handle) {}

    /// A raw `signal(handle, n)` is used here as an immediate, synchronous "reopen now"
    /// request — distinct from the mailbox-routed `MessageType::System` reopen the timer
    /// thread sends after `SIGHUP` (spec §4.6); this is the generic out-of-band ABI entry, not
    /// the ordinary message path.
    fn signal(&self, instance: &mut Instance, _handle: Handle, n: i32) {
        let state = instance.downcast_ref::<Arc<StdMutex<LoggerState>>>().expect("logger instance");
        if n == 1 {
            let mut state = state.lock().unwrap();
            if let Some(path) = state.path.clone() {
                state.file = Self::open(&path);
                info!(path, "log file reopened via signal");
            }
        }
    }
}
