//! Status enums for tasks and worker processes.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a task inside a batch, as shown in live status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting for a concurrency slot.
    #[default]
    Queued,
    /// A worker attempt is executing.
    Running,
    /// Last attempt failed; waiting for backoff or resource headroom.
    RetryPending,
    /// Task completed successfully.
    Succeeded,
    /// Task failed and will not be retried.
    Failed,
    /// Last attempt stopped reporting and retries are exhausted.
    TimedOut,
    /// Task was cancelled with its batch.
    Cancelled,
}

impl TaskState {
    /// Every state, in lifecycle order.
    pub const ALL: [TaskState; 7] = [
        Self::Queued,
        Self::Running,
        Self::RetryPending,
        Self::Succeeded,
        Self::Failed,
        Self::TimedOut,
        Self::Cancelled,
    ];

    /// Returns true if the task will not change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Lowercase label used in metrics and console output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryPending => "retry_pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine of a single worker process attempt.
///
/// `Spawned -> Running -> {Succeeded | Failed | TimedOut | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Spawned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl WorkerState {
    /// Returns true if the worker has exited.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Spawned | Self::Running)
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        match (self, next) {
            (Self::Spawned, Self::Running) => true,
            // A worker can die before its first output.
            (Self::Spawned | Self::Running, n) if n.is_terminal() => true,
            _ => false,
        }
    }

    /// Perform a transition, rejecting illegal ones.
    pub fn transition(&mut self, next: WorkerState) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }
}
