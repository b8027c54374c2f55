//! Error types for tempo.
//!
//! The queue primitives themselves are infallible; these errors surface at the
//! boundaries (configuration, pool intake, deadlines).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("deadline exceeded")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
