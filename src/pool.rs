//! Bounded worker pool.
//!
//! A fixed set of long-lived workers pull tasks from one shared channel, so
//! at most `concurrency` scheduled tasks run at the same time. Scheduling is
//! fire-and-forget: callers that need results or completion signals bring
//! their own channels.
//!
//! A task that panics takes its worker down with it. The pool logs the loss
//! and keeps running on the survivors; lost workers are not replaced, so a
//! buggy task shows up as shrinking capacity instead of being masked.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_task_finished, start_task_span};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name reported in logs and metrics.
    pub name: String,
    /// Number of workers, i.e. the maximum number of tasks running at once.
    pub concurrency: usize,
    /// Tasks that may wait for a free worker before `schedule` blocks.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 1024,
        }
    }
}

/// A fixed-size set of workers executing scheduled tasks.
pub struct WorkerPool {
    name: Arc<str>,
    concurrency: usize,
    tx: mpsc::Sender<Task>,
    live: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` workers with the default queue capacity.
    pub fn new(concurrency: usize) -> Self {
        Self::with_config(PoolConfig {
            concurrency,
            ..PoolConfig::default()
        })
    }

    /// Start a pool from `config`. Must be called within a tokio runtime.
    pub fn with_config(config: PoolConfig) -> Self {
        let concurrency = if config.concurrency == 0 {
            warn!(pool = %config.name, "worker pool concurrency of 0 raised to 1");
            1
        } else {
            config.concurrency
        };

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let name: Arc<str> = Arc::from(config.name);
        let live = Arc::new(AtomicUsize::new(concurrency));

        let workers = (0..concurrency)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&name),
                    Arc::clone(&rx),
                    Arc::clone(&live),
                ))
            })
            .collect();

        debug!(pool = %name, concurrency, "worker pool started");

        Self {
            name,
            concurrency,
            tx,
            live,
            workers,
        }
    }

    /// Queue `task` for execution by the next free worker.
    ///
    /// Never runs the task inline. Waits for room when the task channel is
    /// full, and fails with [`Error::PoolClosed`] once every worker is gone.
    pub async fn schedule<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::pin(task))
            .await
            .map_err(|_| Error::PoolClosed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured number of workers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Workers still running. Drops below [`WorkerPool::concurrency`] only
    /// when tasks panicked.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, let workers finish everything already queued,
    /// and wait for them to exit.
    pub async fn close(self) {
        let Self {
            name, tx, workers, ..
        } = self;
        drop(tx);

        for handle in workers {
            match handle.await {
                Err(e) if !e.is_panic() => warn!(pool = %name, "worker join failed: {e}"),
                _ => {}
            }
        }
        debug!(pool = %name, "worker pool closed");
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn worker_loop(
    id: usize,
    name: Arc<str>,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    live: Arc<AtomicUsize>,
) {
    let _live = LiveGuard(live);
    let labels = [KeyValue::new("pool", name.to_string())];

    loop {
        // Only the receive happens under the lock; tasks run unlocked.
        let task = rx.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        let span = start_task_span(&name, id);
        let start = Instant::now();
        let outcome = AssertUnwindSafe(task)
            .catch_unwind()
            .instrument(span.clone())
            .await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        if let Err(panic) = outcome {
            error!(
                pool = %name,
                worker = id,
                duration_ms,
                "task panicked, worker terminated and will not be replaced"
            );
            metrics::pool_workers_lost().add(1, &labels);
            std::panic::resume_unwind(panic);
        }

        record_task_finished(&span, duration_ms);
        metrics::pool_tasks().add(1, &labels);
        metrics::task_duration_ms().record(duration_ms, &labels);
    }
}
