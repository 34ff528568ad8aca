//! Error types for the supervisor.

use batchrun_core::{BatchId, CoreError, TaskId};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by supervisor operations.
///
/// Per-task failures (spawn errors, crashes, timeouts) never appear here;
/// they end up in the task's outcome instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Submit was called with no tasks.
    #[error("Batch must contain at least one task")]
    EmptyBatch,

    /// A task id repeats within the batch or collides with a running batch.
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    /// The batch handle is not known to this supervisor.
    #[error("Unknown batch: {0}")]
    UnknownBatch(BatchId),

    /// Run was called twice for the same batch.
    #[error("Batch already started: {0}")]
    BatchAlreadyStarted(BatchId),

    /// An outcome was recorded twice for the same task.
    #[error("Outcome already recorded for task: {0}")]
    DuplicateOutcome(TaskId),

    /// Finalize was called while tasks were still without an outcome.
    #[error("{remaining} task(s) have no outcome yet")]
    OutcomesPending { remaining: usize },

    /// An outcome arrived for a task that is not part of the batch.
    #[error("Outcome recorded for unknown task: {0}")]
    UnknownTask(TaskId),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Domain invariant violated.
    #[error(transparent)]
    Core(#[from] CoreError),
}
