//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every variable is
//! optional; the primitives themselves take plain arguments and never read
//! the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool size (`TEMPO_WORKERS`).
    pub workers: usize,
    /// Tasks that may wait for a free worker (`TEMPO_POOL_CAPACITY`).
    pub pool_capacity: usize,
    /// Initial heap capacity of the delay queue (`TEMPO_DELAY_CAPACITY`).
    pub delay_capacity: usize,
    /// Base period of retry loops (`TEMPO_BACKOFF_MS`).
    pub backoff: Duration,
    /// Jitter factor applied to `backoff` (`TEMPO_JITTER`).
    pub jitter: f64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pool_capacity: 1024,
            delay_capacity: 64,
            backoff: Duration::from_millis(1000),
            jitter: 0.1,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parsed_var("TEMPO_WORKERS")?.unwrap_or(defaults.workers),
            pool_capacity: parsed_var("TEMPO_POOL_CAPACITY")?.unwrap_or(defaults.pool_capacity),
            delay_capacity: parsed_var("TEMPO_DELAY_CAPACITY")?
                .unwrap_or(defaults.delay_capacity),
            backoff: parsed_var("TEMPO_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
            jitter: parsed_var("TEMPO_JITTER")?.unwrap_or(defaults.jitter),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        if config.workers == 0 {
            return Err(Error::Config("TEMPO_WORKERS must be at least 1".to_string()));
        }
        if !config.jitter.is_finite() || config.jitter < 0.0 {
            return Err(Error::Config(format!(
                "TEMPO_JITTER must be a non-negative number, got {}",
                config.jitter
            )));
        }
        Ok(config)
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
