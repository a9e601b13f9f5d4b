//! A de-duplicating, rate-limited work queue of workload keys.
//!
//! A key is either dirty (waiting to be processed), processing, or both when it was added again
//! while a worker held it. A processing key is never handed to a second worker, it goes back on the
//! queue when the first worker calls [`WorkQueue::done`].

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use fnv::{FnvHashMap, FnvHashSet};
use tokio::sync::Notify;
use tracing::trace;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: FnvHashSet<String>,
    processing: FnvHashSet<String>,
    failures: FnvHashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        trace!(key, "Queueing key");
        state.dirty.insert(key.to_owned());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_owned());
        drop(state);
        self.notify.notify_one();
    }

    /// Add the key once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Backoff for the key, doubling with each failure since the last [`WorkQueue::forget`].
    pub fn when(&self, key: &str) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.to_owned()).or_default();
        let exponent = *failures;
        *failures += 1;
        BASE_DELAY
            .checked_mul(2u32.saturating_pow(exponent))
            .map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
    }

    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.when(key);
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or_default()
    }

    /// Wait for the next key, `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark the key as no longer processing, requeueing it if it was added in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
