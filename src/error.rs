//! Error types for splitlab
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Splitlab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Experiment input or patch violates an invariant (nothing was stored)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No experiment with this id exists
    #[error("Experiment not found: {0}")]
    NotFound(String),

    /// Lifecycle operation not allowed from the current status
    #[error("Cannot {operation} experiment {id} while it is {status}\nAllowed: {allowed}")]
    InvalidState {
        /// Experiment id
        id: String,
        /// Current status of the experiment
        status: String,
        /// Rejected operation (start, stop, pause, ...)
        operation: &'static str,
        /// Statuses from which the operation is allowed
        allowed: &'static str,
    },

    /// Engine configuration rejected
    #[error("Invalid engine configuration: {0}")]
    Config(String),

    /// No tokio runtime available to run simulation ticks
    #[error("No tokio runtime available\nBuild the engine inside a runtime or pass one via ExperimentManagerBuilder::runtime")]
    RuntimeUnavailable,

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true for `NotFound` errors.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for `InvalidState` errors.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns true for `Validation` errors.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
