// src/error.rs
//
// Error taxonomy for the tuning loop.
//
// Precondition violations (dimension mismatches, missing info keys, zero
// capacity) are fatal: they surface to the caller and abort the run. Timeouts
// are not errors at all; they travel as `continue_training = false` through
// the rollout return value.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("required info key '{0}' is missing")]
    MissingInfo(&'static str),

    #[error("replay buffer capacity must be > 0")]
    ZeroCapacity,

    #[error("cannot sample from an empty replay buffer")]
    EmptyBuffer,

    #[error("invalid config in '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    #[error("{field} must be an absolute path, got {}", path.display())]
    NotResolved { field: &'static str, path: PathBuf },

    #[error("step {step} out of range (run has {num_steps} steps)")]
    StepOutOfRange { step: usize, num_steps: usize },

    #[error("no free resource among {tried} candidates")]
    NoFreeResource { tried: usize },

    #[error("environment failure: {0}")]
    Environment(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl TuneError {
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        TuneError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// True for caller/configuration bugs rather than runtime conditions.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            TuneError::DimensionMismatch { .. }
                | TuneError::MissingInfo(_)
                | TuneError::ZeroCapacity
                | TuneError::EmptyBuffer
        )
    }
}

pub type Result<T> = std::result::Result<T, TuneError>;
