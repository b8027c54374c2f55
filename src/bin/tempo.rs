//! tempo CLI: exercise the dispatcher and jitter sources from the shell.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tempo::backoff::{self, Jitter};
use tempo::config::Config;
use tempo::engine::{DispatchConfig, Dispatcher};
use tempo::pool::PoolConfig;
use tempo::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "tempo", about = "Delay queues, work queues and worker pools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a dispatcher over generated delayed jobs until they are handled
    Run {
        /// Number of jobs to schedule
        #[arg(long, default_value_t = 100)]
        jobs: u64,
        /// Distinct keys; jobs sharing a key coalesce
        #[arg(long, default_value_t = 20)]
        distinct: u64,
        /// Upper bound of the random delay before a job becomes due
        #[arg(long, default_value_t = 2000)]
        max_delay_ms: u64,
        /// Simulated handling time per key
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
        /// Worker count (overrides TEMPO_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Sample the jitter functions and report the observed range
    Jitter {
        /// Nominal duration
        #[arg(long, default_value_t = 1000)]
        base_ms: u64,
        /// Factor for jitter-up and fraction for jitter-around
        #[arg(long, default_value_t = 0.1)]
        factor: f64,
        #[arg(long, default_value_t = 10_000)]
        samples: u32,
        /// Seed for reproducible samples
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run {
            jobs,
            distinct,
            max_delay_ms,
            work_ms,
            workers,
        } => {
            let config = Config {
                workers: workers.unwrap_or(config.workers),
                ..config
            };
            cmd_run(config, jobs, distinct.max(1), max_delay_ms, work_ms).await
        }
        Command::Jitter {
            base_ms,
            factor,
            samples,
            seed,
        } => cmd_jitter(base_ms, factor, samples, seed),
    }
}

async fn cmd_run(
    config: Config,
    jobs: u64,
    distinct: u64,
    max_delay_ms: u64,
    work_ms: u64,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tempo".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let handled = Arc::new(AtomicU64::new(0));
    let work = Duration::from_millis(work_ms);
    let dispatcher = Dispatcher::start(
        DispatchConfig {
            delay_capacity: config.delay_capacity,
            pool: PoolConfig {
                name: "tempo".to_string(),
                concurrency: config.workers,
                queue_capacity: config.pool_capacity,
            },
        },
        {
            let handled = Arc::clone(&handled);
            move |key: u64| {
                let handled = Arc::clone(&handled);
                async move {
                    tokio::time::sleep(work).await;
                    handled.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "key handled");
                }
            }
        },
    );

    // Around half the bound with a jitter of 1 spreads delays over [0, bound].
    let mut jitter = Jitter::from_entropy();
    let half = Duration::from_millis(max_delay_ms / 2);
    for job in 0..jobs {
        dispatcher.schedule_after(job % distinct, jitter.around(half, 1.0));
    }
    info!(jobs, distinct, "jobs scheduled");

    let idle = CancellationToken::new();
    let report = backoff::jitter_until(
        || {
            let stats = dispatcher.stats();
            info!(
                delayed = stats.delayed,
                pending = stats.queue.pending,
                processing = stats.queue.processing,
                handled = handled.load(Ordering::Relaxed),
                "progress"
            );
            if stats.delayed == 0
                && stats.queue.pending == 0
                && stats.queue.processing == 0
                && stats.queue.dirty == 0
            {
                idle.cancel();
            }
            std::future::ready(())
        },
        config.backoff,
        config.jitter,
        true,
        &idle,
    );

    tokio::select! {
        _ = report => info!("all jobs handled"),
        _ = tokio::signal::ctrl_c() => info!("interrupt received, draining (interrupt again to force)"),
    }

    let force = dispatcher.force_handle();
    let forcer = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, forcing shutdown");
            force.force();
        }
    });

    let stats = dispatcher.stats();
    let stopped = dispatcher.shutdown(true).await;
    forcer.abort();
    stopped?;

    let summary = json!({
        "scheduled": jobs,
        "handled": handled.load(Ordering::Relaxed),
        "at_shutdown": stats,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_jitter(base_ms: u64, factor: f64, samples: u32, seed: Option<u64>) -> anyhow::Result<()> {
    let mut jitter = match seed {
        Some(seed) => Jitter::seeded(seed),
        None => Jitter::from_entropy(),
    };
    let base = Duration::from_millis(base_ms);

    let mut up = (Duration::MAX, Duration::ZERO);
    let mut around = (Duration::MAX, Duration::ZERO);
    for _ in 0..samples {
        let d = jitter.up(base, factor);
        up = (up.0.min(d), up.1.max(d));
        let d = jitter.around(base, factor);
        around = (around.0.min(d), around.1.max(d));
    }

    let summary = json!({
        "base_ms": base_ms,
        "factor": factor,
        "samples": samples,
        "jitter_up_ms": [up.0.as_secs_f64() * 1000.0, up.1.as_secs_f64() * 1000.0],
        "jitter_around_ms": [around.0.as_secs_f64() * 1000.0, around.1.as_secs_f64() * 1000.0],
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
