//! Parallel task supervisor for BatchRun.
//!
//! Runs a batch of independent tasks through an external worker program,
//! each in its own workspace, with bounded and load-aware concurrency,
//! failure classification, retries with backoff, and a consolidated report.
//!
//! # Example
//!
//! ```rust,no_run
//! use batchrun_core::{Task, TaskId};
//! use batchrun_supervisor::{Supervisor, SupervisorConfig, WorkerCommand};
//!
//! async fn run_batch() -> Result<(), Box<dyn std::error::Error>> {
//!     let command = WorkerCommand::new("./worker.sh").arg("{task_id}");
//!     let supervisor = Supervisor::builder(SupervisorConfig::default(), command).build()?;
//!
//!     let tasks = vec![
//!         Task::new(TaskId::new("a")?, serde_json::json!({"input": 1})),
//!         Task::new(TaskId::new("b")?, serde_json::json!({"input": 2})),
//!     ];
//!     let batch = supervisor.submit(tasks).await?;
//!     let report = supervisor.run(&batch).await?;
//!
//!     println!("{} of {} succeeded", report.summary.succeeded, report.summary.total);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod classifier;
pub mod config;
mod error;
pub mod metrics;
pub mod monitor;
pub mod process;
pub mod retry;
pub mod status;
mod supervisor;
pub mod workspace;

pub use aggregator::ResultAggregator;
pub use classifier::{FailureClassifier, PatternClassifier};
pub use config::{ClassifierConfig, ConfigError, RetryConfig, SupervisorConfig, ThrottleConfig};
pub use error::SupervisorError;
pub use monitor::{should_throttle, FixedMonitor, ResourceMonitor, ResourceSnapshot, SystemMonitor};
pub use process::{SignalKind, WorkerCommand, WorkerError, WorkerExit, WorkerProcess};
pub use retry::RetryPolicy;
pub use status::{StatusSnapshot, TaskStatus};
pub use supervisor::{BatchHandle, Supervisor, SupervisorBuilder, SupervisorEvent};
pub use workspace::{
    DirectoryProvisioner, WorkspaceError, WorkspaceHandle, WorkspaceLease, WorkspaceProvisioner,
};
