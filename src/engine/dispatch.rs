//! Dispatcher: delayed keys -> dedup work queue -> worker pool.
//!
//! Keys scheduled for later sit in a [`DelayQueue`] until they expire, then
//! move into the [`WorkQueue`], where repeated submissions of a key coalesce.
//! Consumer loops check keys out and run the handler on the [`WorkerPool`],
//! marking each key done once its handler returns (or panics). A key is only
//! checked out once a worker slot is free, so keys waiting for capacity stay
//! pending in the work queue.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::{PoolConfig, WorkerPool};
use crate::queue::{DelayQueue, QueueStats, WorkQueue, now_millis};

/// Configuration for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Initial heap capacity of the delay stage.
    pub delay_capacity: usize,
    pub pool: PoolConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delay_capacity: 64,
            pool: PoolConfig {
                name: "dispatch".to_string(),
                ..PoolConfig::default()
            },
        }
    }
}

/// Point-in-time view of a [`Dispatcher`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub delayed: usize,
    pub queue: QueueStats,
    pub live_workers: usize,
}

/// Cloneable handle that aborts a dispatcher, including one that is
/// currently draining.
pub struct ForceShutdown<K> {
    queue: Arc<WorkQueue<K>>,
    halt: CancellationToken,
}

impl<K> Clone for ForceShutdown<K> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            halt: self.halt.clone(),
        }
    }
}

impl<K> ForceShutdown<K>
where
    K: Eq + Hash + Clone,
{
    /// Stop handing out keys and end any drain in progress.
    pub fn force(&self) {
        self.halt.cancel();
        self.queue.shut_down();
    }
}

/// Runs a handler for every submitted key, at most once per key at a time.
pub struct Dispatcher<K> {
    delay: DelayQueue<K>,
    queue: Arc<WorkQueue<K>>,
    pool: Arc<WorkerPool>,
    /// Stops the delay stage.
    exit: CancellationToken,
    /// Stops the consumer loops.
    halt: CancellationToken,
    poller: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl<K> Dispatcher<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Start the delay stage, one consumer loop per pool worker, and the pool.
    /// Must be called within a tokio runtime.
    pub fn start<H, Fut>(config: DispatchConfig, handler: H) -> Self
    where
        H: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (delay, mut poller, mut expired) = DelayQueue::new(config.delay_capacity);
        let queue = Arc::new(WorkQueue::new());
        let pool = Arc::new(WorkerPool::with_config(config.pool));
        let exit = CancellationToken::new();
        let halt = CancellationToken::new();
        let handler = Arc::new(handler);
        let slots = Arc::new(Semaphore::new(pool.concurrency()));

        let poller = {
            let exit = exit.clone();
            tokio::spawn(async move { poller.poll(&exit, now_millis).await })
        };

        // Ends once the poller is dropped and the output channel closes.
        let forwarder = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(key) = expired.recv().await {
                    queue.add(key);
                }
            })
        };

        let consumers = (0..pool.concurrency())
            .map(|id| {
                tokio::spawn(consume(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&pool),
                    Arc::clone(&slots),
                    Arc::clone(&handler),
                    halt.clone(),
                ))
            })
            .collect();

        info!(workers = pool.concurrency(), "dispatcher started");

        Self {
            delay,
            queue,
            pool,
            exit,
            halt,
            poller,
            forwarder,
            consumers,
        }
    }

    /// Queue `key` for immediate processing.
    pub fn submit(&self, key: K) {
        self.queue.add(key);
    }

    /// Queue `key` once the epoch-millisecond timestamp `expiration` passes.
    pub fn schedule_at(&self, key: K, expiration: i64) {
        self.delay.offer(key, expiration);
    }

    /// Queue `key` after `delay`.
    pub fn schedule_after(&self, key: K, delay: Duration) {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.schedule_at(key, now_millis().saturating_add(delay_ms));
    }

    pub fn force_handle(&self) -> ForceShutdown<K> {
        ForceShutdown {
            queue: Arc::clone(&self.queue),
            halt: self.halt.clone(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delayed: self.delay.len(),
            queue: self.queue.stats(),
            live_workers: self.pool.live_workers(),
        }
    }

    /// Stop the dispatcher.
    ///
    /// Keys still waiting in the delay stage are discarded. With `drain`,
    /// keys already in the work queue and those being handled run to
    /// completion first; a [`ForceShutdown`] fired meanwhile cuts the drain
    /// short. Without `drain`, no further keys are started and handlers
    /// already running are not waited for.
    ///
    /// Fails if one of the dispatcher's own tasks (the delay poller, the
    /// forwarder or a consumer loop) panicked. Shutdown still runs to the end.
    pub async fn shutdown(self, drain: bool) -> Result<()> {
        let Self {
            delay,
            queue,
            pool,
            exit,
            halt,
            poller,
            forwarder,
            consumers,
        } = self;

        exit.cancel();
        let mut failure = join("poller", poller).await;
        failure = failure.or(join("forwarder", forwarder).await);
        if !delay.is_empty() {
            debug!(discarded = delay.len(), "dropping delayed keys on shutdown");
        }

        if drain {
            info!("dispatcher draining");
            queue.shut_down_with_drain().await;
        } else {
            halt.cancel();
            queue.shut_down();
        }
        // Nothing left to hand out; stop the consumer loops.
        halt.cancel();

        for consumer in consumers {
            failure = failure.or(join("consumer", consumer).await);
        }

        // Workers still busy after a forced stop are left to finish on their
        // own; the pool closes once the last of them returns.
        let in_flight = queue.stats().processing;
        match Arc::try_unwrap(pool) {
            Ok(pool) if in_flight == 0 => pool.close().await,
            _ => warn!(in_flight, "not waiting for in-flight tasks"),
        }
        info!("dispatcher stopped");
        failure.map_or(Ok(()), Err)
    }
}

async fn join(role: &str, handle: JoinHandle<()>) -> Option<Error> {
    match handle.await {
        Ok(()) => None,
        Err(e) => {
            warn!(task = role, "dispatcher task failed: {e}");
            Some(Error::Other(format!("dispatcher {role} failed: {e}")))
        }
    }
}

/// Marks the key done and frees its worker slot when dropped, so a panicking
/// handler cannot wedge it in the processing set.
struct DoneGuard<K: Eq + Hash + Clone> {
    queue: Arc<WorkQueue<K>>,
    key: K,
    _slot: OwnedSemaphorePermit,
}

impl<K: Eq + Hash + Clone> Drop for DoneGuard<K> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

async fn consume<K, H, Fut>(
    id: usize,
    queue: Arc<WorkQueue<K>>,
    pool: Arc<WorkerPool>,
    slots: Arc<Semaphore>,
    handler: Arc<H>,
    halt: CancellationToken,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    H: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let slot = tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            slot = Arc::clone(&slots).acquire_owned() => slot,
        };
        // The semaphore is never closed.
        let Ok(slot) = slot else {
            break;
        };

        let key = tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            key = queue.get() => key,
        };
        let Some(key) = key else {
            break;
        };

        let guard = DoneGuard {
            queue: Arc::clone(&queue),
            key: key.clone(),
            _slot: slot,
        };
        let handler = Arc::clone(&handler);
        let task = async move {
            let _guard = guard;
            handler(key).await;
        };

        // A task that is never handed to the pool drops its guard, which
        // releases the key.
        let scheduled = tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            scheduled = pool.schedule(task) => scheduled,
        };
        if scheduled.is_err() {
            warn!(consumer = id, "worker pool closed, consumer stopping");
            break;
        }
    }
    debug!(consumer = id, "consumer stopped");
}
