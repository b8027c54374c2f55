//! Jittered delays and periodic retry loops.
//!
//! [`Jitter`] perturbs nominal delays with an injectable random source so
//! callers (and tests) control determinism. [`JitteredBackoffManager`] turns
//! a base period into a reusable timer, and [`backoff_until`] with its
//! [`until`] / [`jitter_until`] shorthands drive a function on that timer
//! until a stop token fires.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::telemetry::metrics;

/// Source of jitter. Wraps any [`Rng`]; seed it for reproducible delays.
#[derive(Debug, Clone)]
pub struct Jitter<R = StdRng> {
    rng: R,
}

impl Jitter<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl Default for Jitter<StdRng> {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl<R: Rng> Jitter<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// `duration` plus up to `factor` times itself, i.e. a value in
    /// `[d, d * (1 + factor)]`. A non-positive `factor` means 1.
    pub fn up(&mut self, duration: Duration, factor: f64) -> Duration {
        let factor = if factor <= 0.0 { 1.0 } else { factor };
        let r: f64 = self.rng.r#gen();
        scale(duration, 1.0 + r * factor)
    }

    /// `duration` moved up or down by at most `jitter` times itself, i.e. a
    /// value in `[d * (1 - jitter), d * (1 + jitter)]`, floored at zero.
    pub fn around(&mut self, duration: Duration, jitter: f64) -> Duration {
        let r: f64 = self.rng.r#gen();
        scale(duration, 1.0 + jitter * (r * 2.0 - 1.0))
    }
}

/// [`Jitter::up`] with the thread-local generator.
pub fn jitter_up(duration: Duration, factor: f64) -> Duration {
    Jitter::new(rand::thread_rng()).up(duration, factor)
}

/// [`Jitter::around`] with the thread-local generator.
pub fn jitter_around(duration: Duration, jitter: f64) -> Duration {
    Jitter::new(rand::thread_rng()).around(duration, jitter)
}

fn scale(duration: Duration, multiplier: f64) -> Duration {
    if multiplier <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(duration.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}

/// Hands out the timer to wait on before the next attempt.
pub trait BackoffManager {
    /// Arm the timer for the next interval and return it.
    ///
    /// The timer is reused between calls. Await (or abandon) the returned
    /// timer before calling again; the borrow makes it impossible to hold two.
    fn backoff(&mut self) -> Pin<&mut Sleep>;
}

/// Backs off by a fixed period, optionally stretched by [`Jitter::up`].
pub struct JitteredBackoffManager<R = StdRng> {
    timer: Option<Pin<Box<Sleep>>>,
    duration: Duration,
    jitter: f64,
    rng: Jitter<R>,
}

impl JitteredBackoffManager<StdRng> {
    /// Back off by `duration`, jittered up by `jitter`. A non-positive
    /// `jitter` disables jitter.
    pub fn new(duration: Duration, jitter: f64) -> Self {
        Self::with_jitter(duration, jitter, Jitter::from_entropy())
    }
}

impl<R: Rng> JitteredBackoffManager<R> {
    pub fn with_jitter(duration: Duration, jitter: f64, rng: Jitter<R>) -> Self {
        Self {
            timer: None,
            duration,
            jitter,
            rng,
        }
    }

    fn next_backoff(&mut self) -> Duration {
        if self.jitter > 0.0 {
            self.rng.up(self.duration, self.jitter)
        } else {
            self.duration
        }
    }
}

impl<R: Rng> BackoffManager for JitteredBackoffManager<R> {
    fn backoff(&mut self) -> Pin<&mut Sleep> {
        let period = self.next_backoff();
        let deadline = Instant::now() + period;
        trace!(period_ms = period.as_millis() as u64, "backing off");

        let timer = self
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        timer.as_mut().reset(deadline);
        timer.as_mut()
    }
}

/// Run `f` every `period` until `stop` fires, timing from the end of each run.
pub async fn until<F, Fut>(f: F, period: Duration, stop: &CancellationToken)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    jitter_until(f, period, 0.0, true, stop).await
}

/// Run `f` every `period` jittered up by `jitter_factor` until `stop` fires.
///
/// See [`backoff_until`] for the meaning of `sliding`.
pub async fn jitter_until<F, Fut>(
    f: F,
    period: Duration,
    jitter_factor: f64,
    sliding: bool,
    stop: &CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut backoff = JitteredBackoffManager::new(period, jitter_factor);
    backoff_until(f, &mut backoff, sliding, stop).await
}

/// Run `f` repeatedly, waiting on `backoff` between runs, until `stop` fires.
///
/// With `sliding` the interval starts after `f` returns; without it the
/// interval starts before `f` runs, so a slow `f` eats into the wait.
///
/// `stop` is checked before each run and raced against the timer after it,
/// with the stop branch polled first. A run already in progress is never
/// interrupted, and a stop that lands just as the timer fires may still let
/// one more run start.
pub async fn backoff_until<F, Fut, B>(
    mut f: F,
    backoff: &mut B,
    sliding: bool,
    stop: &CancellationToken,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
    B: BackoffManager + ?Sized,
{
    loop {
        if stop.is_cancelled() {
            return;
        }

        let timer = if sliding {
            f().await;
            backoff.backoff()
        } else {
            let timer = backoff.backoff();
            f().await;
            timer
        };
        metrics::backoff_iterations().add(1, &[]);

        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = timer => {}
        }
    }
}
