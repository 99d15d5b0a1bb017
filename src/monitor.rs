//! Liveness tracking: detects services that stall or loop forever inside one message.
//!
//! Each worker owns one slot recording the destination it is *currently* dispatching to, plus
//! a version counter bumped every time a new dispatch begins. Spec §4.5 step 3: a worker
//! touches its slot right before invoking the callback for one message, and clears it (back to
//! destination 0) right after that callback returns. Every 5 seconds a background thread
//! compares the slots against the previous snapshot; a slot whose *destination is still
//! non-zero* and whose version hasn't moved means that worker has been stuck inside the same
//! callback for a full sampling period. A slot sitting at destination 0 is an idle worker
//! between dispatches, never a stuck one, regardless of how stale its version is. This is
//! diagnostic only — skynet logs a warning and moves on, it never kills the service, since
//! there's no safe way to preempt a native call mid-execution.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::handle::Handle;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

struct Slot {
    destination: AtomicU32,
    version: AtomicU64,
}

/// One slot per worker thread, sampled by a dedicated background thread.
pub struct Monitor {
    slots: Vec<Slot>,
    shutdown: Mutex<bool>,
}

impl Monitor {
    pub fn new(worker_count: usize) -> Self {
        Monitor {
            slots: (0..worker_count)
                .map(|_| Slot { destination: AtomicU32::new(0), version: AtomicU64::new(0) })
                .collect(),
            shutdown: Mutex::new(false),
        }
    }

    /// Called by a worker immediately before it invokes the callback for one message (spec
    /// §4.5 step 3), so the sampling thread can see which destination it's currently on and
    /// tell real progress (a new `begin` bumping the version) from a stall (the version
    /// frozen across a whole sample period).
    pub fn begin(&self, worker_index: usize, destination: Handle) {
        let slot = &self.slots[worker_index];
        slot.destination.store(destination.0, Ordering::Relaxed);
        slot.version.fetch_add(1, Ordering::Relaxed);
    }

    /// Called immediately after the callback returns (spec §4.5 step 3: "Clear the monitor
    /// slot (indicating 'not currently dispatching')"). Resets `destination` to 0 so a worker
    /// sitting idle between dispatches is never reported as stuck.
    pub fn end(&self, worker_index: usize) {
        self.slots[worker_index].destination.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<(u32, u64)> {
        self.slots
            .iter()
            .map(|s| (s.destination.load(Ordering::Relaxed), s.version.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn request_shutdown(&self) {
        *self.shutdown.lock() = true;
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }
}

/// Spawns the monitor's sampling thread.
pub fn spawn(monitor: Arc<Monitor>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mailrt-monitor".into())
        .spawn(move || {
            let mut previous = monitor.snapshot();
            loop {
                thread::sleep(SAMPLE_INTERVAL);
                if monitor.is_shutdown() {
                    break;
                }
                let current = monitor.snapshot();
                for (i, ((_, prev_version), (now_dest, now_version))) in
                    previous.iter().zip(current.iter()).enumerate()
                {
                    if *now_dest != 0 && prev_version == now_version {
                        warn!(worker = i, destination = %Handle(*now_dest), "worker appears stuck dispatching");
                    }
                }
                previous = current;
            }
        })
        .expect("failed to spawn monitor thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_advances_version_and_sets_destination() {
        let monitor = Monitor::new(2);
        let before = monitor.snapshot();
        monitor.begin(0, Handle(7));
        let after = monitor.snapshot();
        assert_ne!(after, before);
        assert_eq!(after[0].0, 7);
    }

    #[test]
    fn end_clears_destination_so_an_idle_worker_is_never_stuck() {
        let monitor = Monitor::new(1);
        monitor.begin(0, Handle(7));
        monitor.end(0);
        let (destination, _version) = monitor.snapshot()[0];
        assert_eq!(destination, 0, "a finished dispatch must clear the slot's destination");
    }

    #[test]
    fn a_frozen_version_only_looks_stuck_while_destination_is_nonzero() {
        // Regression for the bug where the sampler gated on `version` alone: an idle worker
        // (destination cleared by `end`) keeps the same frozen version forever and must
        // never be reported, only a worker still mid-dispatch (`begin` without a matching
        // `end`) with an unmoved version should be.
        let monitor = Monitor::new(1);
        monitor.begin(0, Handle(7));
        let stuck_snapshot = monitor.snapshot();
        monitor.end(0);
        let idle_snapshot = monitor.snapshot();

        assert_eq!(stuck_snapshot[0].1, idle_snapshot[0].1, "end() must not bump the version");
        assert_ne!(stuck_snapshot[0].0, 0, "mid-dispatch slot must carry a non-zero destination");
        assert_eq!(idle_snapshot[0].0, 0, "post-end slot must read as idle, not stuck");
    }
}
