//! BatchRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Process spawning
//! - Async runtimes
//! - Filesystem layout
//!
//! All types here describe a batch of tasks, the progress their workers
//! report, the failures they hit and the report the batch produces.

pub mod error;
pub mod event;
pub mod failure;
pub mod ids;
pub mod outcome;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{ProgressEvent, ProgressLine, ProgressRecord};
pub use failure::{FailureCategory, FailureHistory, FailureRecord};
pub use ids::{BatchId, TaskId};
pub use outcome::{AggregateReport, ReportSummary, TaskOutcome};
pub use status::{TaskState, WorkerState};
pub use task::{ResourceHints, Task, TaskSpec};
