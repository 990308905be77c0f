//! Per-transaction expiry timers.
//!
//! A single worker thread owns a deadline queue. When a timer elapses the
//! worker places a [`TimerEvent`] on the channel supplied at start-up; the
//! consumer decides whether to re-arm (retry) or give up. The worker never
//! calls back into the consumer, and sending on the unbounded channel never
//! blocks, so one firing cannot hold up another.

use crate::types::RequestId;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A timer elapsed for `transaction` while at retry count `retry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub transaction: RequestId,
    pub retry: u32,
}

struct Entry {
    retry: u32,
    generation: u64,
}

#[derive(Default)]
struct TimerState {
    entries: HashMap<RequestId, Entry>,
    /// Deadlines in firing order. Cancelled or replaced timers stay queued
    /// until they surface and fail the generation check.
    queue: BinaryHeap<Reverse<(Instant, u64, RequestId)>>,
    next_generation: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    events: Sender<TimerEvent>,
}

/// Manages one-shot expiry timers keyed by transaction.
pub struct TimerManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TimerManager {
    /// Start the timer worker, delivering expiries to `events`.
    pub fn start(events: Sender<TimerEvent>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
            events,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("submgr-timers".into())
            .spawn(move || run_worker(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Arm (or re-arm) the timer of `transaction`. A pending timer for the
    /// same transaction is replaced.
    pub fn arm(&self, transaction: RequestId, deadline: Instant, retry: u32) {
        let mut state = self.shared.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(transaction, Entry { retry, generation });
        state.queue.push(Reverse((deadline, generation, transaction)));
        drop(state);

        trace!(%transaction, retry, "timer armed");
        self.shared.wakeup.notify_one();
    }

    pub fn arm_after(&self, transaction: RequestId, delay: Duration, retry: u32) {
        self.arm(transaction, Instant::now() + delay, retry);
    }

    /// Cancel a pending timer. Returns false if none was pending (already
    /// fired, cancelled, or never armed); that case is a no-op.
    pub fn cancel(&self, transaction: RequestId) -> bool {
        let removed = self.shared.state.lock().entries.remove(&transaction).is_some();
        if removed {
            trace!(%transaction, "timer cancelled");
        }
        removed
    }

    pub fn is_armed(&self, transaction: RequestId) -> bool {
        self.shared.state.lock().entries.contains_key(&transaction)
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Stop the worker. Pending timers are dropped without firing.
    pub fn shutdown(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            debug!("timer worker stopping");
            return;
        }

        let fired = collect_due(&mut state, Instant::now());
        if !fired.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for event in fired {
                    // Receiver gone means the consumer shut down first.
                    let _ = shared.events.send(event);
                }
            });
            continue;
        }

        let next_deadline = state.queue.peek().map(|Reverse((deadline, _, _))| *deadline);
        match next_deadline {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

fn collect_due(state: &mut TimerState, now: Instant) -> Vec<TimerEvent> {
    let mut fired = Vec::new();
    while let Some(Reverse((deadline, generation, transaction))) = state.queue.peek().copied() {
        if deadline > now {
            break;
        }
        state.queue.pop();

        let live = matches!(state.entries.get(&transaction), Some(e) if e.generation == generation);
        if live {
            if let Some(entry) = state.entries.remove(&transaction) {
                fired.push(TimerEvent {
                    transaction,
                    retry: entry.retry,
                });
            }
        }
    }
    fired
}
