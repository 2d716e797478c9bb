//! # foresight-core
//!
//! Core library for foresight - a telemetry and retraining pipeline for
//! desktop-automation agents.
//!
//! This library provides:
//! - Domain types for user actions, system metrics, and retraining records
//! - A bounded event store backed by SQLite with retry/backoff
//! - A deterministic feature builder
//! - A next-action classifier and a CPU/memory forecaster
//! - A retraining scheduler with timeouts and a bounded shutdown run
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow leaf to root:
//! - **Event store:** validated [`UserAction`]s and [`SystemMetric`]s in bounded buffers
//! - **Persistence:** every event is appended durably; buffers are warmed on startup
//! - **Models:** trained from a snapshot of the buffers, swapped in atomically
//! - **Scheduler:** decides when to retrain and records every attempt
//!
//! ## Example
//!
//! ```rust,no_run
//! use foresight_core::{Config, Foresight};
//!
//! let config = Config::load().expect("failed to load config");
//! let foresight = Foresight::open(config).expect("failed to open pipeline");
//!
//! foresight
//!     .record_user_action("text_editing", "notepad", 2.5, true)
//!     .expect("invalid action");
//!
//! match foresight.predict_next_action() {
//!     Ok(prediction) => println!("{} ({:.0}%)", prediction.action_type, prediction.confidence * 100.0),
//!     Err(e) => println!("no prediction yet: {}", e),
//! }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use engine::{Engine, Foresight, MlStats};
pub use error::{Error, Result};
pub use sampler::{MetricsSource, SysinfoSource};
pub use scheduler::{RetrainScheduler, TrainingLock, TrainingTarget};
pub use store::Durability;
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod features;
pub mod insights;
pub mod journal;
pub mod logging;
pub mod models;
pub mod sampler;
pub mod scheduler;
pub mod store;
pub mod types;
