//! Composition of the primitives into a running dispatcher.

pub mod dispatch;

pub use dispatch::{DispatchConfig, DispatchStats, Dispatcher, ForceShutdown};
