//! Deduplicating work queue with per-key exponential backoff
//!
//! Keys move through three states: pending (waiting for a worker), processing
//! (handed out by [`WorkQueue::get`]) and dirty (added again while pending or
//! processing). A key is never handed to two workers at once; a key added
//! while it is being processed is re-queued when the worker calls
//! [`WorkQueue::done`].
//!
//! Failed keys go through [`WorkQueue::requeue`], which delays the re-add by
//! `base * 2^failures` capped at `max`. The failure count is per key and is
//! cleared by [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-key exponential backoff policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a policy with the given floor and ceiling
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt after `failures` prior failures
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Work queue of APIService names awaiting reconciliation
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a key; returns false if it was already pending or the queue is shut down
    pub fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return false;
        }
        if state.processing.contains(&key) {
            // Re-queued by done()
            return true;
        }
        state.pending.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Enqueue a key after `delay`
    ///
    /// Must be called from within a tokio runtime. Pending delayed adds are
    /// dropped on shutdown.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(key);
                }
            }
        });
    }

    /// Re-add a key after its backoff delay and bump its failure count
    pub fn requeue(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        trace!(key = %key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.pending.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as finished processing
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if !state.shutting_down && state.dirty.contains(key) {
            state.pending.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clear the failure history of a key
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Number of failures recorded for a key since it was last forgotten
    pub fn retries(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and release every blocked [`get`](Self::get)
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
