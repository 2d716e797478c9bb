//! foresight-daemon - long-running telemetry sampler and retraining scheduler
//!
//! Samples system metrics on a fixed period, retrains the models on the
//! configured schedule, and makes one last bounded retraining attempt when
//! asked to stop (Ctrl+C or SIGTERM). The exit code reports that final
//! attempt: 0 when it completed or had nothing to do, 1 when it failed or
//! timed out.

use anyhow::{Context, Result};
use clap::Parser;
use foresight_core::{Config, Engine, Foresight, SysinfoSource};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "foresight-daemon")]
#[command(about = "Sample system metrics and retrain prediction models")]
#[command(version)]
struct Args {
    /// Do not sample system metrics; only run the retraining schedule
    #[arg(long)]
    no_sample: bool,

    /// Metric sampling period in seconds (overrides scheduler.sample_interval_secs)
    #[arg(long)]
    sample_interval: Option<u64>,

    /// Stop on our own after this many seconds
    #[arg(long)]
    run_for: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        foresight_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let sample_interval = args
        .sample_interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| config.scheduler.sample_interval());

    tracing::info!(path = %Config::database_path().display(), "foresight-daemon starting");
    let foresight = Foresight::open(config).context("failed to open pipeline")?;

    // Set up signal handler for graceful shutdown
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        on_signal.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    foresight.start();

    let sampler = if args.no_sample {
        None
    } else {
        Some(tokio::spawn(sampling_loop(
            foresight.engine().clone(),
            sample_interval,
            shutdown.child_token(),
        )))
    };

    println!(
        "foresight-daemon running (session {}). Press Ctrl+C to stop.",
        foresight.engine().store().session_id()
    );

    match args.run_for {
        Some(secs) => {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "Run time elapsed");
                }
            }
        }
        None => shutdown.cancelled().await,
    }
    shutdown.cancel();

    if let Some(sampler) = sampler {
        if let Err(e) = sampler.await {
            tracing::warn!(error = %e, "Sampling loop ended abnormally");
        }
    }

    let record = foresight.shutdown().await;
    println!("Shutdown retraining: {}", record.status);
    if let Some(message) = &record.message {
        println!("  {}", message);
    }

    if record.status.is_failed() {
        tracing::error!(run_id = %record.run_id, status = %record.status, "foresight-daemon stopped after failed retraining");
        Ok(ExitCode::FAILURE)
    } else {
        tracing::info!(run_id = %record.run_id, status = %record.status, "foresight-daemon stopped");
        Ok(ExitCode::SUCCESS)
    }
}

/// Record one metric sample per period until cancelled.
async fn sampling_loop(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut source = Some(SysinfoSource::new());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(mut current) = source.take() else {
                    break;
                };
                let engine = engine.clone();
                let sampled = tokio::task::spawn_blocking(move || {
                    let result = engine.record_system_metrics(&mut current);
                    (current, result)
                })
                .await;

                match sampled {
                    Ok((current, result)) => {
                        source = Some(current);
                        match result {
                            Ok((metric, durability)) => tracing::debug!(
                                cpu = metric.cpu_usage,
                                memory = metric.memory_usage,
                                persisted = durability.is_persisted(),
                                "Sampled system metrics"
                            ),
                            Err(e) => tracing::warn!(error = %e, "Metric sample rejected"),
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Metric sampler task died");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Sampling loop shutting down");
                break;
            }
        }
    }
}
