//! Queue primitives: an expiration-ordered heap, the delay queue built on it,
//! and the deduplicating work queue.

pub mod delay;
pub mod fifo;
pub mod heap;

pub use delay::{DelayQueue, Poller, now_millis};
pub use fifo::{QueueStats, WorkQueue};
pub use heap::{Item, PriorityQueue};
