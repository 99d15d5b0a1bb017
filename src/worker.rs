//! The fixed-size worker pool: N OS threads pulling from the global ready queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::dispatch::{self, Outcome};
use crate::handle::Registry;
use crate::mailbox::ReadyQueue;
use crate::monitor::Monitor;

/// Static per-worker weight table (spec §4.6): workers at the front of the pool process one
/// message per tick (quick to yield, good for latency-sensitive traffic); workers further
/// back drain exponentially larger batches (good throughput on backlogged mailboxes).
const WEIGHT_TABLE: &[i32] = &[
    -1, -1, -1, -1, // 4 workers: one message per tick
    0, 0, 0, 0, // 4 workers: weight 0 (n >> 0 = n, i.e. drain everything ready)
    1, 1, 1, 1, 1, 1, 1, 1, // 8 workers: weight 1 (n >> 1)
    2, 2, 2, 2, 2, 2, 2, 2, // 8 workers: weight 2
    3, 3, 3, 3, 3, 3, 3, 3, // 8 workers: weight 3
];

fn weight_for(worker_index: usize) -> i32 {
    WEIGHT_TABLE[worker_index % WEIGHT_TABLE.len()]
}

struct SleepState {
    sleep_count: usize,
    shutdown: bool,
}

/// Shared sleep/wake coordination so idle workers park instead of spinning, and exactly
/// enough of them wake for the work that just arrived.
pub struct WorkerSignal {
    state: Mutex<SleepState>,
    condvar: Condvar,
    worker_count: usize,
}

impl WorkerSignal {
    pub fn new(worker_count: usize) -> Self {
        WorkerSignal {
            state: Mutex::new(SleepState { sleep_count: 0, shutdown: false }),
            condvar: Condvar::new(),
            worker_count,
        }
    }

    /// Wakes one sleeping worker, if any. `busy` is the number of workers presently not
    /// sleeping (e.g. known to already be dispatching); the rule `sleep_count >= N - busy`
    /// means: only bother waking someone if there's actually spare sleeping capacity beyond
    /// what's already busy.
    pub fn wake_one(&self, busy: usize) {
        let state = self.state.lock();
        if state.sleep_count >= self.worker_count.saturating_sub(busy) {
            self.condvar.notify_one();
        }
    }

    pub fn wake_all(&self) {
        self.condvar.notify_all();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.condvar.notify_all();
    }

    fn sleep(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.sleep_count += 1;
        self.condvar.wait_for(&mut state, timeout);
        state.sleep_count -= 1;
        !state.shutdown
    }
}

/// Owns the worker threads and the primitives they share.
pub struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
    pub signal: Arc<WorkerSignal>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `count` worker threads, each looping on [`dispatch::dispatch_one`] with its
    /// table-assigned weight, sleeping on `signal` when the ready queue is empty.
    pub fn spawn(
        count: usize,
        registry: Arc<Registry>,
        queue: Arc<ReadyQueue>,
        monitor: Arc<Monitor>,
    ) -> Self {
        let signal = Arc::new(WorkerSignal::new(count));
        let busy = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let registry = registry.clone();
            let queue = queue.clone();
            let signal = signal.clone();
            let monitor = monitor.clone();
            let busy = busy.clone();
            let weight = weight_for(index);

            let handle = thread::Builder::new()
                .name(format!("mailrt-worker-{index}"))
                .spawn(move || {
                    busy.fetch_add(1, Ordering::AcqRel);
                    loop {
                        match dispatch::dispatch_one(&registry, &queue, weight, &monitor, index) {
                            Outcome::Drained { .. } => {}
                            Outcome::Idle => {
                                busy.fetch_sub(1, Ordering::AcqRel);
                                let still_running = signal.sleep(Duration::from_millis(100));
                                busy.fetch_add(1, Ordering::AcqRel);
                                if !still_running {
                                    break;
                                }
                            }
                        }
                    }
                    debug!(worker = index, "worker thread exiting");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool { handles: Mutex::new(handles), signal, busy }
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Signals every worker to exit and joins them. Blocks until all threads have returned.
    pub fn shutdown(&self) {
        self.signal.shutdown();
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_table_matches_spec_layout() {
        assert_eq!(WEIGHT_TABLE.len(), 32);
        assert_eq!(&WEIGHT_TABLE[0..4], &[-1, -1, -1, -1]);
        assert_eq!(&WEIGHT_TABLE[4..8], &[0, 0, 0, 0]);
        assert_eq!(&WEIGHT_TABLE[8..16], &[1; 8]);
        assert_eq!(&WEIGHT_TABLE[16..24], &[2; 8]);
        assert_eq!(&WEIGHT_TABLE[24..32], &[3; 8]);
    }

    #[test]
    fn weight_for_wraps_past_table_length() {
        assert_eq!(weight_for(0), weight_for(32));
    }
}
