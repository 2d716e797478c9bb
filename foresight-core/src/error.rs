//! Error types for foresight-core

use rusqlite::ErrorCode;
use thiserror::Error;

/// Main error type for the foresight-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed event rejected at the event store boundary
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Durable write failed after exhausting retries
    #[error("persistence failed after {attempts} attempt(s): {message}")]
    Persistence { attempts: u32, message: String },

    /// Training attempted below the minimum-sample threshold
    #[error("{model} needs at least {required} samples, have {available}")]
    InsufficientData {
        model: &'static str,
        required: usize,
        available: usize,
    },

    /// Prediction requested before any successful training
    #[error("{model} model is not trained")]
    NotTrained { model: &'static str },

    /// Another training run holds the models
    #[error("another training run is in progress")]
    TrainingBusy,

    /// Training run was cancelled before it finished
    #[error("training cancelled")]
    Cancelled,

    /// The examples admit no fit (e.g. a singular system)
    #[error("{model} fit failed: {message}")]
    ModelFit { model: &'static str, message: String },

    /// System metrics could not be sampled
    #[error("metrics sampler error: {0}")]
    Sampler(String),
}

impl Error {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    /// Whether the error is transient lock contention worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for foresight-core
pub type Result<T> = std::result::Result<T, Error>;
