//! Core domain errors.

use thiserror::Error;

/// Core domain errors for BatchRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task id was empty or contained only whitespace.
    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A failure record arrived out of attempt order.
    #[error("Failure record for task '{task_id}' has attempt {attempt}, expected > {last}")]
    NonMonotonicAttempt {
        task_id: String,
        attempt: u32,
        last: u32,
    },

    /// A failure record was appended to another task's history.
    #[error("Failure record for task '{got}' appended to history of '{expected}'")]
    ForeignFailureRecord { expected: String, got: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
