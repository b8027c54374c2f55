//! Metric instrument factories for tempo.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tempo"` meter; without an
//! installed provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tempo instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tempo")
}

/// Counter: items offered to a delay queue.
pub fn delay_offered() -> Counter<u64> {
    meter()
        .u64_counter("tempo.delay.offered")
        .with_description("Number of items offered to a delay queue")
        .build()
}

/// Counter: expired items handed to the delay queue's output channel.
pub fn delay_delivered() -> Counter<u64> {
    meter()
        .u64_counter("tempo.delay.delivered")
        .with_description("Number of expired items delivered by a delay queue")
        .build()
}

/// Counter: work queue `add` calls.
/// Labels: `result` ("queued" | "duplicate" | "deferred" | "dropped").
pub fn work_added() -> Counter<u64> {
    meter()
        .u64_counter("tempo.work.added")
        .with_description("Number of keys added to a work queue")
        .build()
}

/// Counter: keys re-enqueued by `done` because they were re-added mid-processing.
pub fn work_requeued() -> Counter<u64> {
    meter()
        .u64_counter("tempo.work.requeued")
        .with_description("Number of keys redelivered after processing")
        .build()
}

/// Counter: tasks executed by worker pools.
/// Labels: `pool`.
pub fn pool_tasks() -> Counter<u64> {
    meter()
        .u64_counter("tempo.pool.tasks")
        .with_description("Number of tasks executed by a worker pool")
        .build()
}

/// Counter: workers lost to a panicking task.
/// Labels: `pool`.
pub fn pool_workers_lost() -> Counter<u64> {
    meter()
        .u64_counter("tempo.pool.workers_lost")
        .with_description("Number of pool workers terminated by a panic")
        .build()
}

/// Counter: backoff loop iterations.
pub fn backoff_iterations() -> Counter<u64> {
    meter()
        .u64_counter("tempo.backoff.iterations")
        .with_description("Number of times a backoff loop invoked its function")
        .build()
}

/// Histogram: task duration in milliseconds.
/// Labels: `pool`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tempo.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
