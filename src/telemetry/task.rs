//! Task execution span helpers.
//!
//! Provides span creation and outcome recording for tasks run by a
//! worker pool.

use tracing::Span;

/// Start a span for one task executed by `worker` of pool `pool`.
///
/// The `task.duration_ms` field is declared empty and can be filled via
/// [`record_task_finished`].
pub fn start_task_span(pool: &str, worker: usize) -> Span {
    tracing::debug_span!(
        "task.execute",
        "task.pool" = pool,
        "task.worker" = worker,
        "task.duration_ms" = tracing::field::Empty,
    )
}

/// Record completion of a task on its span.
pub fn record_task_finished(span: &Span, duration_ms: f64) {
    span.record("task.duration_ms", duration_ms);
    span.in_scope(|| {
        tracing::trace!(duration_ms, "task finished");
    });
}
