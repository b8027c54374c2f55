//! # tempo
//!
//! Concurrency-control primitives for scheduling and throttling async work
//! inside a service.
//!
//! Provides a delay queue (expiration-ordered delivery), a deduplicating work
//! queue with drain-or-abort shutdown, a bounded worker pool, jittered
//! backoff loops, and a dispatcher composing them, with tracing and
//! OpenTelemetry instrumentation.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod queue;
pub mod telemetry;
pub mod timeout;
