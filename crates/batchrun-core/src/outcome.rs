//! Terminal task outcomes and the aggregate batch report.

use crate::{BatchId, FailureCategory, FailureRecord, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Terminal record of one task. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,

    /// Terminal state: Succeeded, Failed, TimedOut or Cancelled.
    pub final_state: TaskState,

    /// Time from first admission to the terminal state, in milliseconds.
    pub duration_ms: u64,

    /// Number of worker attempts that were started.
    pub attempt_count: u32,

    /// Last artifact reference reported by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact: Option<String>,

    /// Category of the last failure, if the task ever failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,

    /// Diagnostic text of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,

    /// Every failed attempt in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureRecord>,
}

impl TaskOutcome {
    /// Outcome with no failure details.
    pub fn new(task_id: TaskId, final_state: TaskState, duration: Duration, attempt_count: u32) -> Self {
        Self {
            task_id,
            final_state,
            duration_ms: duration.as_millis() as u64,
            attempt_count,
            output_artifact: None,
            category: None,
            diagnostic: None,
            failures: Vec::new(),
        }
    }

    /// Builder method to attach an artifact reference.
    pub fn with_artifact(mut self, artifact: Option<String>) -> Self {
        self.output_artifact = artifact;
        self
    }

    /// Builder method to attach the failure history.
    ///
    /// Category and diagnostic are taken from the last record.
    pub fn with_failures(mut self, failures: Vec<FailureRecord>) -> Self {
        if let Some(last) = failures.last() {
            self.category = Some(last.category);
            self.diagnostic = Some(last.diagnostic.clone());
        }
        self.failures = failures;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// True if the task succeeded after at least one failed attempt.
    pub fn succeeded_after_retry(&self) -> bool {
        self.final_state == TaskState::Succeeded && !self.failures.is_empty()
    }
}

/// Summary statistics of a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Failed tasks, including those that timed out.
    pub failed: usize,
    /// Subset of `failed` whose last attempt timed out.
    pub timed_out: usize,
    pub cancelled: usize,
    /// Subset of `succeeded` that needed more than one attempt.
    pub succeeded_after_retry: usize,
    /// Total attempts started across all tasks.
    pub total_attempts: u64,
    /// Wall-clock duration of the batch, in milliseconds.
    pub total_duration_ms: u64,
    /// Peak number of simultaneously running workers.
    pub concurrency_achieved: usize,
}

impl ReportSummary {
    /// Compute summary counts over a set of outcomes.
    pub fn from_outcomes<'a>(
        outcomes: impl IntoIterator<Item = &'a TaskOutcome>,
        wall_clock: Duration,
        peak_concurrency: usize,
    ) -> Self {
        let mut summary = Self {
            total_duration_ms: wall_clock.as_millis() as u64,
            concurrency_achieved: peak_concurrency,
            ..Self::default()
        };

        for outcome in outcomes {
            summary.total += 1;
            summary.total_attempts += u64::from(outcome.attempt_count);
            match outcome.final_state {
                TaskState::Succeeded => {
                    summary.succeeded += 1;
                    if outcome.succeeded_after_retry() {
                        summary.succeeded_after_retry += 1;
                    }
                }
                TaskState::TimedOut => {
                    summary.failed += 1;
                    summary.timed_out += 1;
                }
                TaskState::Cancelled => summary.cancelled += 1,
                // Non-terminal states never reach a report; count them as failed.
                _ => summary.failed += 1,
            }
        }

        summary
    }
}

/// Consolidated report of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub batch_id: BatchId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<TaskId, TaskOutcome>,
    pub summary: ReportSummary,
}

impl AggregateReport {
    pub fn outcome(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.outcomes.get(task_id)
    }

    /// True if every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.summary.succeeded == self.summary.total
    }

    /// Render as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, crate::CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
