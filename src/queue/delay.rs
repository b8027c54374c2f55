//! Delay queue: hands out elements only once their expiration has passed.
//!
//! Producers share a cloneable [`DelayQueue`] handle and call
//! [`DelayQueue::offer`]. A single [`Poller`] owns the consumer side: it sleeps
//! until the earliest item expires (or an earlier one is offered) and pushes
//! expired values onto the output channel in expiration order.
//!
//! The poller parks in one of two ways: with nothing queued it waits for a
//! wake signal; with a pending head it also races a timer. The wake protocol
//! is a two-state machine guarded by the heap mutex. The poller marks itself
//! `Sleeping` in the same critical section that found nothing to deliver, and
//! `offer` flips `Sleeping -> Awake` and posts the signal in the same
//! critical section that pushed a new head. At most one signal is therefore
//! outstanding per park, and a one-slot mailbox carries it without blocking
//! the producer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::heap::{Item, PriorityQueue};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakeState {
    Awake,
    Sleeping,
}

struct Inner<T> {
    pq: PriorityQueue<T>,
    state: WakeState,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    wake_tx: mpsc::Sender<()>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer handle of a delay queue. Cheap to clone.
pub struct DelayQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The one consumer of a delay queue.
///
/// There is exactly one `Poller` per queue and [`Poller::poll`] takes it by
/// `&mut`, so two poll loops can never run against the same heap.
pub struct Poller<T> {
    shared: Arc<Shared<T>>,
    wake_rx: mpsc::Receiver<()>,
    output: mpsc::Sender<T>,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<T> DelayQueue<T> {
    /// Create a queue whose heap is pre-sized for `size` items.
    ///
    /// Returns the producer handle, the poller and the receiving end of the
    /// output channel expired values are delivered on.
    pub fn new(size: usize) -> (Self, Poller<T>, mpsc::Receiver<T>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (output, output_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                pq: PriorityQueue::with_capacity(size),
                state: WakeState::Awake,
            }),
            wake_tx,
        });
        let poller = Poller {
            shared: Arc::clone(&shared),
            wake_rx,
            output,
        };
        (Self { shared }, poller, output_rx)
    }

    /// Insert `value`, to be delivered once `expiration` (epoch ms) has passed.
    ///
    /// Never blocks. Wakes the poller if the value became the new head while
    /// the poller was parked.
    pub fn offer(&self, value: T, expiration: i64) {
        let mut inner = self.shared.lock();
        let index = inner.pq.push(Item::new(value, expiration));
        if index == 0 && inner.state == WakeState::Sleeping {
            inner.state = WakeState::Awake;
            // The slot is free: every earlier signal was consumed or drained
            // before the poller could go back to Sleeping.
            let _ = self.shared.wake_tx.try_send(());
            trace!(expiration, "woke delay queue poller");
        }
        drop(inner);
        metrics::delay_offered().add(1, &[]);
    }

    /// Number of items not yet delivered.
    pub fn len(&self) -> usize {
        self.shared.lock().pq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Poller<T> {
    /// Deliver expired items until `exit` is cancelled or the output receiver
    /// is dropped.
    ///
    /// `now` supplies the current time in the same unit and epoch as the
    /// expirations passed to [`DelayQueue::offer`]; usually [`now_millis`].
    /// An item already taken off the heap when `exit` fires is discarded.
    pub async fn poll<F>(&mut self, exit: &CancellationToken, now: F)
    where
        F: Fn() -> i64,
    {
        loop {
            let (item, delta) = {
                let mut inner = self.shared.lock();
                let (item, delta) = inner.pq.peek_and_shift(now());
                if item.is_none() {
                    // Same critical section as the peek, so an offer either
                    // lands before it (and is seen) or after (and wakes us).
                    inner.state = WakeState::Sleeping;
                }
                (item, delta)
            };

            let Some(item) = item else {
                if delta == 0 {
                    tokio::select! {
                        _ = self.wake_rx.recv() => continue,
                        _ = exit.cancelled() => break,
                    }
                }

                tokio::select! {
                    _ = self.wake_rx.recv() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(delta as u64)) => {
                        self.timer_fired();
                        continue;
                    }
                    _ = exit.cancelled() => break,
                }
            };

            tokio::select! {
                biased;
                _ = exit.cancelled() => break,
                sent = self.output.send(item.value) => {
                    if sent.is_err() {
                        debug!("delay queue output receiver dropped, stopping poller");
                        break;
                    }
                    metrics::delay_delivered().add(1, &[]);
                }
            }
        }

        self.shared.lock().state = WakeState::Awake;
        let _ = self.wake_rx.try_recv();
    }

    /// Leave a timed park. If an offer already flipped the state to `Awake`
    /// it also posted a signal that nobody will wait for now; drop it so the
    /// next park only wakes for a fresh offer.
    fn timer_fired(&mut self) {
        let raced = {
            let mut inner = self.shared.lock();
            std::mem::replace(&mut inner.state, WakeState::Awake) == WakeState::Awake
        };
        if raced {
            let _ = self.wake_rx.try_recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    fn park(poller: &Poller<u32>) {
        poller.shared.lock().state = WakeState::Sleeping;
    }

    #[test]
    fn timer_fire_after_offer_drains_stale_wake() {
        let (queue, mut poller, _out) = DelayQueue::new(4);
        park(&poller);
        queue.offer(1, 50);
        assert_eq!(poller.shared.lock().state, WakeState::Awake);

        poller.timer_fired();
        assert_eq!(poller.wake_rx.try_recv(), Err(TryRecvError::Empty));

        // The next park is woken by exactly one fresh signal.
        park(&poller);
        queue.offer(2, 10);
        assert_eq!(poller.wake_rx.try_recv(), Ok(()));
        assert_eq!(poller.wake_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn timer_fire_without_offer_only_wakes_poller() {
        let (_queue, mut poller, _out) = DelayQueue::<u32>::new(4);
        park(&poller);

        poller.timer_fired();
        assert_eq!(poller.shared.lock().state, WakeState::Awake);
        assert_eq!(poller.wake_rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_after_drained_wake_waits_for_expiry() {
        let start = Instant::now();
        let now = move || start.elapsed().as_millis() as i64;
        let (queue, mut poller, mut out) = DelayQueue::new(4);

        park(&poller);
        queue.offer(1u32, 100);
        poller.timer_fired();

        let exit = CancellationToken::new();
        let poll = poller.poll(&exit, now);
        tokio::pin!(poll);

        let first = tokio::select! {
            _ = &mut poll => None,
            v = out.recv() => v,
        };
        assert_eq!(first, Some(1));
        assert!(start.elapsed() >= Duration::from_millis(100));

        // Parked on an empty heap: only this offer can wake it.
        queue.offer(2, now() + 30);
        let second = tokio::select! {
            _ = &mut poll => None,
            v = out.recv() => v,
        };
        assert_eq!(second, Some(2));
        assert!(start.elapsed() >= Duration::from_millis(130));

        exit.cancel();
        poll.await;
    }
}
