//! foresight - record desktop telemetry and query its predictions
//!
//! One-shot subcommands over the pipeline stored at the XDG locations:
//! - Database: $XDG_DATA_HOME/foresight/foresight.db (~/.local/share/foresight/foresight.db)
//! - Logs: $XDG_STATE_HOME/foresight/foresight.log (~/.local/state/foresight/foresight.log)
//! - Config: $XDG_CONFIG_HOME/foresight/config.toml (~/.config/foresight/config.toml)

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use foresight_core::models::TrainingResult;
use foresight_core::{
    Config, Error, Foresight, PredictionContext, RetrainingRecord, SysinfoSource, SystemMetric,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "foresight")]
#[command(about = "Record desktop activity and predict what comes next")]
#[command(version)]
struct Args {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record one user action
    RecordAction {
        /// Category label, e.g. "text_editing"
        action_type: String,
        /// Foreground application
        application: String,
        /// Duration of the action in seconds
        #[arg(short, long, default_value = "0")]
        duration: f64,
        /// Mark the action as failed
        #[arg(long)]
        failed: bool,
    },
    /// Record one system metric sample (sampled from the OS unless given)
    RecordMetrics {
        /// CPU utilization percent
        #[arg(long, requires_all = ["memory", "disk"])]
        cpu: Option<f64>,
        /// Memory utilization percent
        #[arg(long, requires = "cpu")]
        memory: Option<f64>,
        /// Disk utilization percent
        #[arg(long, requires = "cpu")]
        disk: Option<f64>,
        /// Active process count
        #[arg(long, requires = "cpu", default_value = "0")]
        processes: u32,
    },
    /// Train models on the buffered events
    Train {
        #[arg(value_enum, default_value = "all")]
        model: ModelArg,
    },
    /// Predict the next user action
    Predict {
        /// Action in progress (defaults to the newest recorded one)
        #[arg(long)]
        action_type: Option<String>,
        /// Application in use (defaults to the newest recorded one)
        #[arg(long)]
        application: Option<String>,
        /// Time of the action in progress, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// List recent actions the behavior model could not explain
    Anomalies {
        /// Flag actions whose best prediction is below this confidence
        /// (defaults to models.anomaly_threshold)
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Forecast CPU and memory utilization
    Forecast,
    /// Show pipeline counters and model state
    Stats,
    /// Run a manual retraining attempt
    Retrain,
    /// Show recent retraining attempts
    History {
        /// Records to show, newest first
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Summarize recorded behavior
    Patterns,
    /// Suggest automations from recorded behavior
    Recommend,
    /// Delete stored events older than the retention horizon
    Trim {
        /// Keep this many days (defaults to persistence.retention_days)
        #[arg(long, conflicts_with = "before")]
        days: Option<u32>,
        /// Delete events before this RFC 3339 timestamp
        #[arg(long)]
        before: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Behavior,
    Optimizer,
    All,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        foresight_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let retention_days = config.persistence.retention_days;
    let foresight = Foresight::open(config).context("failed to open pipeline")?;

    match args.command {
        Command::RecordAction {
            action_type,
            application,
            duration,
            failed,
        } => {
            let durability = foresight
                .record_user_action(&action_type, &application, duration, !failed)
                .context("failed to record action")?;
            let action = foresight.engine().store().last_action();
            if args.json {
                print_json(&serde_json::json!({ "action": action, "durability": durability }))?;
            } else {
                println!("Recorded {} in {} ({:?})", action_type.trim(), application.trim(), durability);
            }
        }

        Command::RecordMetrics {
            cpu,
            memory,
            disk,
            processes,
        } => {
            let (metric, durability) = match (cpu, memory, disk) {
                (Some(cpu), Some(memory), Some(disk)) => {
                    let durability = foresight
                        .engine()
                        .record_metric(SystemMetric::new(cpu, memory, disk, processes))
                        .context("failed to record metric")?;
                    let metric = foresight
                        .engine()
                        .store()
                        .last_metric()
                        .context("recorded metric missing from buffer")?;
                    (metric, durability)
                }
                _ => foresight
                    .record_system_metrics(&mut SysinfoSource::new())
                    .context("failed to sample system metrics")?,
            };
            if args.json {
                print_json(&serde_json::json!({ "metric": metric, "durability": durability }))?;
            } else {
                println!(
                    "Recorded cpu {:.1}% memory {:.1}% disk {:.1}% processes {} ({:?})",
                    metric.cpu_usage,
                    metric.memory_usage,
                    metric.disk_usage,
                    metric.active_processes,
                    durability
                );
            }
        }

        Command::Train { model } => {
            let mut results = Vec::new();
            if matches!(model, ModelArg::Behavior | ModelArg::All) {
                results.push(("behavior", foresight.train_behavior_model()));
            }
            if matches!(model, ModelArg::Optimizer | ModelArg::All) {
                results.push(("optimizer", foresight.train_system_optimizer()));
            }
            report_training(results, args.json)?;
        }

        Command::Predict {
            action_type,
            application,
            at,
        } => match foresight.predict_next_action_in(&PredictionContext {
            action_type,
            application,
            at,
        }) {
            Ok(prediction) if args.json => print_json(&prediction)?,
            Ok(prediction) => {
                println!(
                    "Next action: {} ({:.1}% confidence)",
                    prediction.action_type,
                    prediction.confidence * 100.0
                );
                for (label, probability) in prediction.probabilities.iter().skip(1) {
                    println!("  {:<24} {:.1}%", label, probability * 100.0);
                }
            }
            Err(e @ Error::NotTrained { .. }) => not_ready(&e, args.json)?,
            Err(e) => return Err(e).context("prediction failed"),
        },

        Command::Anomalies { threshold } => match foresight.detect_anomalies(threshold) {
            Ok(anomalies) if args.json => print_json(&anomalies)?,
            Ok(anomalies) if anomalies.is_empty() => println!("No anomalies."),
            Ok(anomalies) => {
                for anomaly in &anomalies {
                    println!(
                        "{}  {:<20} {:<20} score {:.3} (expected {})",
                        anomaly.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        anomaly.action_type,
                        anomaly.application,
                        anomaly.anomaly_score,
                        anomaly.expected
                    );
                }
            }
            Err(e @ Error::NotTrained { .. }) => not_ready(&e, args.json)?,
            Err(e) => return Err(e).context("anomaly detection failed"),
        },

        Command::Forecast => match foresight.predict_system_load() {
            Ok(forecast) if args.json => print_json(&forecast)?,
            Ok(forecast) => println!(
                "Forecast {} sample(s) ahead: cpu {:.1}% memory {:.1}%",
                forecast.horizon, forecast.cpu_usage, forecast.memory_usage
            ),
            Err(e @ Error::NotTrained { .. }) => not_ready(&e, args.json)?,
            Err(e) => return Err(e).context("forecast failed"),
        },

        Command::Stats => {
            let stats = foresight.get_ml_stats().context("failed to read stats")?;
            if args.json {
                print_json(&stats)?;
            } else {
                println!("Session:              {}", stats.session_id);
                println!(
                    "Actions:              {} buffered, {} stored",
                    stats.buffered_actions, stats.stored_actions
                );
                println!(
                    "Metrics:              {} buffered, {} stored",
                    stats.buffered_metrics, stats.stored_metrics
                );
                println!("Behavior model:       {}", describe_model(&stats.behavior_model));
                println!("System optimizer:     {}", describe_model(&stats.optimizer_model));
                if let Some(action) = &stats.last_action {
                    println!(
                        "Last action:          {} in {} at {}",
                        action.action_type,
                        action.application,
                        action.timestamp.to_rfc3339()
                    );
                }
                if let Some(metric) = &stats.last_metric {
                    println!(
                        "Last metric:          cpu {:.1}% memory {:.1}% at {}",
                        metric.cpu_usage,
                        metric.memory_usage,
                        metric.timestamp.to_rfc3339()
                    );
                }
                println!("Persistence failures: {}", stats.persistence_failures);
            }
        }

        Command::Retrain => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            let record = runtime.block_on(foresight.trigger_manual_retraining());
            if args.json {
                print_json(&record)?;
            } else {
                print_record(&record);
            }
            if record.status.is_failed() {
                anyhow::bail!("retraining {}", record.status);
            }
        }

        Command::History { limit } => {
            let history = foresight
                .engine()
                .retraining_history(limit)
                .context("failed to read retraining history")?;
            if args.json {
                print_json(&history)?;
            } else if history.is_empty() {
                println!("No retraining attempts recorded.");
            } else {
                for record in &history {
                    print_record(record);
                }
            }
        }

        Command::Patterns => {
            let patterns = foresight
                .engine()
                .behavior_patterns()
                .context("failed to compute patterns")?;
            if args.json {
                print_json(&patterns)?;
            } else {
                println!("Total actions: {}", patterns.total_actions);
                if let Some(rate) = patterns.success_rate {
                    println!("Success rate:  {:.1}%", rate * 100.0);
                }
                print_counts("By hour (UTC)", patterns.by_hour.iter().map(|(h, n)| (format!("{:02}:00", h), *n)));
                print_counts("By weekday", patterns.by_weekday.iter().map(|(d, n)| (weekday_name(*d).to_string(), *n)));
                print_counts("By application", patterns.by_application.iter().map(|(a, n)| (a.clone(), *n)));
                print_counts("By action type", patterns.by_action_type.iter().map(|(t, n)| (t.clone(), *n)));
            }
        }

        Command::Recommend => {
            let suggestions = foresight
                .engine()
                .recommendations()
                .context("failed to compute recommendations")?;
            if args.json {
                print_json(&suggestions)?;
            } else {
                for suggestion in &suggestions {
                    println!("- {}", suggestion);
                }
            }
        }

        Command::Trim { days, before } => {
            let cutoff = match before {
                Some(before) => before,
                None => {
                    let days = days.unwrap_or(retention_days);
                    ChronoDuration::try_days(i64::from(days))
                        .and_then(|keep| Utc::now().checked_sub_signed(keep))
                        .with_context(|| format!("cannot keep {} days: date out of range", days))?
                }
            };
            let trimmed = foresight
                .engine()
                .trim_retention(cutoff)
                .context("failed to trim stored events")?;
            if args.json {
                print_json(&serde_json::json!({ "before": cutoff, "deleted": trimmed }))?;
            } else {
                println!(
                    "Deleted {} action(s) and {} metric(s) before {}",
                    trimmed.actions,
                    trimmed.metrics,
                    cutoff.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode JSON")?
    );
    Ok(())
}

/// Untrained and not-enough-data conditions are reported, not failures.
fn not_ready(error: &Error, json: bool) -> Result<()> {
    if json {
        print_json(&serde_json::json!({ "ready": false, "reason": error.to_string() }))
    } else {
        println!("Not ready: {}", error);
        Ok(())
    }
}

fn report_training(results: Vec<(&str, foresight_core::Result<TrainingResult>)>, json: bool) -> Result<()> {
    let mut report = Vec::new();
    for (name, result) in results {
        match result {
            Ok(result) => {
                if !json {
                    println!(
                        "Trained {} on {} samples (training {:.3}{})",
                        name,
                        result.samples,
                        result.training_score,
                        result
                            .holdout_score
                            .map(|h| format!(", holdout {:.3}", h))
                            .unwrap_or_default()
                    );
                }
                report.push(serde_json::json!({ "model": name, "trained": true, "result": result }));
            }
            Err(e @ (Error::InsufficientData { .. } | Error::TrainingBusy)) => {
                if !json {
                    println!("Skipped {}: {}", name, e);
                }
                report.push(serde_json::json!({ "model": name, "trained": false, "reason": e.to_string() }));
            }
            Err(e) => return Err(e).with_context(|| format!("failed to train {}", name)),
        }
    }
    if json {
        print_json(&report)?;
    }
    Ok(())
}

fn describe_model(model: &foresight_core::engine::ModelStats) -> String {
    match (model.trained_at, model.sample_count) {
        (Some(at), Some(samples)) if model.trained => {
            format!("trained on {} samples at {}", samples, at.to_rfc3339())
        }
        _ => "untrained".to_string(),
    }
}

fn print_record(record: &RetrainingRecord) {
    let models = record
        .models_trained
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "{}  {:<9}  {:<28}  {:>6} ms  [{}]{}",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        record.trigger.as_str(),
        record.status.to_string(),
        record.duration_ms,
        models,
        record
            .message
            .as_deref()
            .map(|m| format!("  {}", m))
            .unwrap_or_default()
    );
}

fn print_counts(title: &str, rows: impl Iterator<Item = (String, i64)>) {
    let rows: Vec<_> = rows.collect();
    if rows.is_empty() {
        return;
    }
    println!("\n{}:", title);
    for (label, count) in rows {
        println!("  {:<24} {}", label, count);
    }
}

fn weekday_name(day: u32) -> &'static str {
    match day {
        0 => "Monday",
        1 => "Tuesday",
        2 => "Wednesday",
        3 => "Thursday",
        4 => "Friday",
        5 => "Saturday",
        _ => "Sunday",
    }
}
