//! Deduplicating FIFO work queue.
//!
//! Keys added while already pending are coalesced; keys added while a
//! consumer holds them are redelivered exactly once after [`WorkQueue::done`].
//! The queue supports an abrupt [`WorkQueue::shut_down`] and a graceful
//! [`WorkQueue::shut_down_with_drain`] that waits for checked-out keys.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Added {
    Queued,
    Duplicate,
    Deferred,
    Dropped,
}

impl Added {
    fn as_str(self) -> &'static str {
        match self {
            Added::Queued => "queued",
            Added::Duplicate => "duplicate",
            Added::Deferred => "deferred",
            Added::Dropped => "dropped",
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need (re)delivery.
    dirty: HashSet<K>,
    /// Keys checked out by a consumer and not yet marked done.
    processing: HashSet<K>,
    shutting_down: bool,
    drain: bool,
}

impl<K> State<K> {
    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.processing.is_empty()
    }
}

/// Point-in-time view of a [`WorkQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub dirty: usize,
    pub shutting_down: bool,
    pub draining: bool,
}

/// A FIFO of unique keys shared by any number of producers and consumers.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    /// Signalled when a key becomes available or the queue shuts down.
    cond: Notify,
    /// Signalled when a drain may have completed or was aborted.
    drained: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
                drain: false,
            }),
            cond: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    ///
    /// Dropped silently once the queue is shutting down. A key that is
    /// already pending is not queued twice; a key being processed is queued
    /// again when its consumer calls [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        let result = {
            let mut state = self.lock();
            if state.shutting_down {
                Added::Dropped
            } else if state.dirty.contains(&key) {
                Added::Duplicate
            } else {
                state.dirty.insert(key.clone());
                if state.processing.contains(&key) {
                    Added::Deferred
                } else {
                    state.queue.push_back(key);
                    Added::Queued
                }
            }
        };

        match result {
            Added::Queued => self.cond.notify_one(),
            Added::Dropped => debug!("work queue is shutting down, dropping key"),
            Added::Duplicate | Added::Deferred => {}
        }
        metrics::work_added().add(1, &[KeyValue::new("result", result.as_str())]);
    }

    /// Wait for the next key and check it out.
    ///
    /// Returns `None` once the queue is shutting down and nothing is pending.
    /// Keys still pending during a drain keep being handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a wakeup between the check
            // and the await is not lost.
            notified.as_mut().enable();

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

    /// Mark `key` as processed.
    ///
    /// If the key was added again while it was checked out it goes to the
    /// back of the queue now. A key that is not checked out is left alone.
    pub fn done(&self, key: &K) {
        let (requeued, drained) = {
            let mut state = self.lock();
            let requeued = state.processing.remove(key) && state.dirty.contains(key);
            if requeued {
                state.queue.push_back(key.clone());
            }
            (requeued, state.drain && state.is_drained())
        };

        if requeued {
            self.cond.notify_one();
            metrics::work_requeued().add(1, &[]);
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Stop accepting keys and release every blocked [`WorkQueue::get`].
    ///
    /// Does not wait for checked-out keys. Aborts a drain in progress: a
    /// pending [`WorkQueue::shut_down_with_drain`] returns immediately.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.drain = false;
        }
        debug!("work queue shut down");
        self.cond.notify_waiters();
        self.drained.notify_waiters();
    }

    /// Stop accepting keys and wait until every pending and checked-out key
    /// has been marked done.
    ///
    /// Consumers must keep calling [`WorkQueue::get`] and
    /// [`WorkQueue::done`] for this to finish. A concurrent
    /// [`WorkQueue::shut_down`] ends the wait.
    pub async fn shut_down_with_drain(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.drain = true;
        }
        debug!("work queue draining");
        self.cond.notify_waiters();

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.is_drained() {
                    state.drain = false;
                    debug!("work queue drained");
                    return;
                }
                if !state.drain {
                    debug!("work queue drain aborted by forced shutdown");
                    return;
                }
            }

            notified.await;
        }
    }

    /// Number of keys waiting to be handed out. Observational only.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.queue.len(),
            processing: state.processing.len(),
            dirty: state.dirty.len(),
            shutting_down: state.shutting_down,
            draining: state.drain,
        }
    }
}
