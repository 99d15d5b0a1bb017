//! Bootstrap: wires the registry, ready queue, module loader, timer, monitor, worker pool
//! and the two mandatory startup services together in the order spec §4.7 requires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::api::DispatchApi;
use crate::config::Config;
use crate::context::ServiceContext;
use crate::error::{BootstrapError, LaunchError, SendError};
use crate::handle::{Handle, Registry};
use crate::mailbox::{Mailbox, ReadyQueue};
use crate::message::{Message, MessageType, Session, SESSION_MASK};
use crate::module::{Instance, Module, ModuleLoader};
use crate::monitor::{self, Monitor};
use crate::timer::{self, Timer};
use crate::worker::WorkerPool;

/// A live runtime: every shared structure a service or worker thread needs a reference to.
///
/// Construction order mirrors skynet's `skynet_start`: harbor id is fixed first (it's baked
/// into every handle minted afterward), then the registry, then the global queue, the
/// module loader, the timer, the monitor, and only then are the logger and bootstrap
/// services launched — both depend on everything above already existing.
pub struct Runtime {
    pub registry: Arc<Registry>,
    pub queue: Arc<ReadyQueue>,
    pub modules: Arc<ModuleLoader>,
    pub timer: Arc<Timer>,
    pub monitor: Arc<Monitor>,
    config: Config,
    worker_pool: std::sync::OnceLock<WorkerPool>,
    timer_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    monitor_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Session source for `send` calls whose `source` isn't itself a registered service (an
    /// external client, or `Handle::SYSTEM`). A registered source always allocates from its
    /// own `ServiceContext::alloc_session` instead, per spec §4.4.
    external_session: AtomicU32,
}

impl Runtime {
    /// The fixed name the logger service is bound under (spec §4.7), independent of
    /// `config.logservice` (which module implements it) or `config.logger` (its init arg).
    const LOGGER_NAME: &'static str = "logger";

    /// Allocates the harbor-scoped registry, ready queue, module loader, timer and monitor.
    /// Does not yet start any threads or services — call [`Self::boot`] for that.
    pub fn new(config: Config) -> Arc<Self> {
        let mut modules = ModuleLoader::new(&config.module_path);
        modules.register_native(Arc::new(crate::module::DemoEchoModule));
        modules.register_native(Arc::new(crate::logger::LoggerModule::new(config.log_path.clone())));

        Arc::new(Runtime {
            registry: Arc::new(Registry::new(config.harbor)),
            queue: Arc::new(ReadyQueue::new()),
            modules: Arc::new(modules),
            timer: Arc::new(Timer::new()),
            monitor: Arc::new(Monitor::new(config.worker_count)),
            config,
            worker_pool: std::sync::OnceLock::new(),
            timer_thread: std::sync::Mutex::new(None),
            monitor_thread: std::sync::Mutex::new(None),
            external_session: AtomicU32::new(1),
        })
    }

    /// Launches a service: resolves `module_name`, creates and `init`s an instance, registers
    /// a handle for it, and publishes its mailbox so the dispatcher can reach it.
    ///
    /// Mirrors `skynet_context_new`: the context exists and is `init`-called *before* it is
    /// visible to anyone else, so a module's `init` can safely assume no message can arrive
    /// for it yet.
    pub fn launch(&self, module_name: &str, args: &str) -> Result<Handle, LaunchError> {
        let module = self.modules.load(module_name).map_err(LaunchError::Module)?;
        let mailbox_handle_placeholder = Handle::SYSTEM;
        let mailbox = Arc::new(Mailbox::new(mailbox_handle_placeholder));
        let ctx = ServiceContext::new_unregistered(module, mailbox);

        let handle = self.registry.register(ctx.clone());
        ctx.set_handle(handle);
        ctx.mailbox().set_handle(handle);

        let api = DispatchApi { ctx: ctx.clone(), registry: &self.registry, queue: &self.queue };
        let ok = ctx.with_instance(|instance: &mut Instance| ctx.module().init(instance, &api, args));
        if !ok {
            self.registry.retire(handle);
            return Err(LaunchError::InitFailed(module_name.to_owned(), handle));
        }
        ctx.mailbox().publish(&self.queue);

        info!(handle = %handle, module = module_name, "service launched");
        Ok(handle)
    }

    /// Registers a name for an already-launched handle (spec §4.3 `bind_name`).
    pub fn name(&self, handle: Handle, name: &str) -> bool {
        self.registry.bind_name(handle, name)
    }

    /// Resolves `name` or a `:HHHHHHHH` literal to a handle.
    pub fn resolve(&self, addr: &str) -> Option<Handle> {
        if addr.starts_with(':') {
            addr.parse().ok()
        } else {
            self.registry.find_name(addr)
        }
    }

    /// Enqueues `payload` for `destination`, allocating a session if `type_` calls for one
    /// and none was supplied.
    ///
    /// Per spec §4.4, a freshly allocated session comes from the *sender's* counter, not the
    /// destination's — it's how the sender later recognizes its own reply. If `source` is
    /// itself a registered service, its `ServiceContext` owns that counter; otherwise (an
    /// external client, or `Handle::SYSTEM`) this falls back to the runtime's own counter.
    pub fn send(
        &self,
        source: Handle,
        destination: Handle,
        type_: MessageType,
        session: Session,
        payload: Option<Vec<u8>>,
    ) -> Result<Session, SendError> {
        if payload.as_ref().is_some_and(|p| p.len() > crate::message::MAX_PAYLOAD_SIZE) {
            return Err(SendError::PayloadTooLarge);
        }
        let dest_ctx = self.registry.grab(destination).ok_or(SendError::NoSuchDestination)?;
        let session = if session == 0 && type_.allocates_session() {
            self.alloc_session_for(source)
        } else {
            session
        };
        let msg = Message { source, session, type_, payload };
        dest_ctx.mailbox().push(msg, &self.queue);
        dest_ctx.release();
        self.wake_for_new_work();
        Ok(session)
    }

    fn alloc_session_for(&self, source: Handle) -> Session {
        match self.registry.grab(source) {
            Some(source_ctx) => {
                let session = source_ctx.alloc_session();
                source_ctx.release();
                session
            }
            None => loop {
                let prev = self.external_session.fetch_add(1, Ordering::Relaxed);
                let session = prev & SESSION_MASK;
                if session != 0 {
                    return session;
                }
            },
        }
    }

    /// Delivers an out-of-band signal to `handle`'s module synchronously, on the caller's own
    /// thread (spec §4.4 "Signals"). This bypasses the mailbox and dispatcher entirely, and
    /// may run concurrently with a worker already dispatching `handle`'s mailbox — modules
    /// implementing `signal` must only touch state safe to mutate from another thread (e.g. an
    /// atomic trap flag). Returns `false` if `handle` doesn't resolve to a live service.
    pub fn signal(&self, handle: Handle, n: i32) -> bool {
        match self.registry.grab(handle) {
            Some(ctx) => {
                ctx.with_instance(|instance| ctx.module().signal(instance, handle, n));
                ctx.release();
                true
            }
            None => false,
        }
    }

    fn wake_for_new_work(&self) {
        if let Some(pool) = self.worker_pool.get() {
            pool.signal.wake_one(pool.busy_count());
        }
    }

    /// Brings the whole runtime up: worker pool, timer, monitor, logger service, then the
    /// named bootstrap service. Returns once the bootstrap service has been launched; the
    /// caller is expected to block on [`Self::join`] afterward.
    pub fn boot(self: &Arc<Self>) -> Result<(), BootstrapError> {
        let pool = WorkerPool::spawn(
            self.config.worker_count,
            self.registry.clone(),
            self.queue.clone(),
            self.monitor.clone(),
        );
        self.worker_pool
            .set(pool)
            .unwrap_or_else(|_| panic!("Runtime::boot called twice"));

        *self.monitor_thread.lock().unwrap() = Some(monitor::spawn(self.monitor.clone()));
        *self.timer_thread.lock().unwrap() = Some(timer::spawn(
            self.timer.clone(),
            self.registry.clone(),
            self.queue.clone(),
            self.worker_pool.get().unwrap().signal.clone(),
            self.config.worker_count,
            Self::LOGGER_NAME.to_owned(),
        ));

        let logger_handle = self
            .launch(&self.config.logservice, &self.config.logger)
            .map_err(|e| BootstrapError::Logger(self.config.logservice.clone(), e))?;
        self.name(logger_handle, Self::LOGGER_NAME);

        let mut parts = self.config.bootstrap.splitn(2, ' ');
        let bootstrap_module = parts.next().unwrap_or("demo_echo");
        let bootstrap_args = parts.next().unwrap_or("");
        self.launch(bootstrap_module, bootstrap_args)
            .map_err(|e| BootstrapError::Bootstrap(bootstrap_module.to_owned(), e))?;

        Ok(())
    }

    /// Signals the timer, monitor, and worker pool to exit, then blocks until all threads
    /// have joined and every registered service has been retired.
    pub fn shutdown(&self) {
        self.timer.request_shutdown();
        self.monitor.request_shutdown();
        if let Some(pool) = self.worker_pool.get() {
            pool.shutdown();
        }
        if let Some(h) = self.timer_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.monitor_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        self.registry.retire_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_registers_and_names_a_service() {
        let rt = Runtime::new(Config { worker_count: 0, ..Config::default() });
        let h = rt.launch("demo_echo", "").expect("demo_echo must launch");
        assert!(rt.name(h, ".demo"));
        assert_eq!(rt.resolve(".demo"), Some(h));
    }

    #[test]
    fn send_to_unknown_destination_is_an_error() {
        let rt = Runtime::new(Config { worker_count: 0, ..Config::default() });
        let result = rt.send(Handle::SYSTEM, Handle(0x01FF_FFFF), MessageType::Text, 0, None);
        assert_eq!(result, Err(SendError::NoSuchDestination));
    }

    #[test]
    fn send_allocates_a_session_for_text_messages() {
        let rt = Runtime::new(Config { worker_count: 0, ..Config::default() });
        let h = rt.launch("demo_echo", "").unwrap();
        let session = rt.send(Handle::SYSTEM, h, MessageType::Text, 0, None).unwrap();
        assert_ne!(session, 0);
    }

    #[test]
    fn oversized_payload_is_refused_before_the_destination_is_even_checked() {
        let rt = Runtime::new(Config { worker_count: 0, ..Config::default() });
        let oversized = vec![0u8; crate::message::MAX_PAYLOAD_SIZE + 1];
        // Use a handle that doesn't resolve to anything: if the size check ran after the
        // destination lookup, this would come back `NoSuchDestination` instead.
        let result = rt.send(Handle::SYSTEM, Handle(0x01FF_FFFF), MessageType::Text, 0, Some(oversized));
        assert_eq!(result, Err(SendError::PayloadTooLarge));
    }
}
