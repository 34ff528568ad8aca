//! Collects per-task outcomes into the batch report.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use batchrun_core::{AggregateReport, BatchId, ReportSummary, TaskId, TaskOutcome};
use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::error::SupervisorError;

/// Accepts exactly one outcome per task of a batch.
#[derive(Debug)]
pub struct ResultAggregator {
    batch_id: BatchId,
    expected: HashSet<TaskId>,
    outcomes: BTreeMap<TaskId, TaskOutcome>,
    started_at: DateTime<Utc>,
    started: Instant,
    peak_concurrency: usize,
}

impl ResultAggregator {
    pub fn new(batch_id: BatchId, task_ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            batch_id,
            expected: task_ids.into_iter().collect(),
            outcomes: BTreeMap::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            peak_concurrency: 0,
        }
    }

    /// Store a task's final outcome.
    ///
    /// A second outcome for the same task is an invariant violation and is
    /// rejected without touching the stored one.
    pub fn record(&mut self, outcome: TaskOutcome) -> Result<(), SupervisorError> {
        if !self.expected.contains(&outcome.task_id) {
            return Err(SupervisorError::UnknownTask(outcome.task_id));
        }
        if self.outcomes.contains_key(&outcome.task_id) {
            error!(task_id = %outcome.task_id, "Duplicate outcome recorded");
            return Err(SupervisorError::DuplicateOutcome(outcome.task_id));
        }
        debug!(
            task_id = %outcome.task_id,
            state = %outcome.final_state,
            attempts = outcome.attempt_count,
            "Outcome recorded"
        );
        self.outcomes.insert(outcome.task_id.clone(), outcome);
        Ok(())
    }

    /// Track the number of workers running right now.
    pub fn observe_concurrency(&mut self, running: usize) {
        self.peak_concurrency = self.peak_concurrency.max(running);
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrency
    }

    /// Tasks still without an outcome.
    pub fn remaining(&self) -> usize {
        self.expected.len() - self.outcomes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Produce the report. Fails if any task has no outcome yet.
    pub fn finalize(self) -> Result<AggregateReport, SupervisorError> {
        let remaining = self.remaining();
        if remaining > 0 {
            return Err(SupervisorError::OutcomesPending { remaining });
        }
        let summary = ReportSummary::from_outcomes(
            self.outcomes.values(),
            self.started.elapsed(),
            self.peak_concurrency,
        );
        Ok(AggregateReport {
            batch_id: self.batch_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcomes: self.outcomes,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchrun_core::{FailureCategory, FailureRecord, TaskState};
    use std::time::Duration;

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    fn aggregator(ids: &[&str]) -> ResultAggregator {
        ResultAggregator::new(BatchId::generate(), ids.iter().map(|s| id(s)))
    }

    #[test]
    fn test_finalize_complete_batch() {
        let mut agg = aggregator(&["a", "b", "c"]);
        agg.observe_concurrency(2);
        agg.observe_concurrency(1);

        agg.record(TaskOutcome::new(id("a"), TaskState::Succeeded, Duration::from_millis(10), 1))
            .unwrap();
        let failures = vec![
            FailureRecord::new(id("b"), 1, FailureCategory::Transient, "timeout"),
            FailureRecord::new(id("b"), 2, FailureCategory::Permanent, "bad input"),
        ];
        agg.record(
            TaskOutcome::new(id("b"), TaskState::Failed, Duration::from_millis(20), 2)
                .with_failures(failures),
        )
        .unwrap();
        assert_eq!(agg.remaining(), 1);
        agg.record(TaskOutcome::new(id("c"), TaskState::Cancelled, Duration::ZERO, 0))
            .unwrap();
        assert!(agg.is_complete());

        let report = agg.finalize().unwrap();
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.cancelled, 1);
        assert_eq!(report.summary.total_attempts, 3);
        assert_eq!(report.summary.concurrency_achieved, 2);
        let b = report.outcome(&id("b")).unwrap();
        assert_eq!(b.category, Some(FailureCategory::Permanent));
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn test_duplicate_outcome_rejected() {
        let mut agg = aggregator(&["a"]);
        agg.record(TaskOutcome::new(id("a"), TaskState::Succeeded, Duration::ZERO, 1))
            .unwrap();
        let err = agg
            .record(TaskOutcome::new(id("a"), TaskState::Failed, Duration::ZERO, 2))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateOutcome(_)));

        let report = agg.finalize().unwrap();
        assert_eq!(report.outcome(&id("a")).unwrap().final_state, TaskState::Succeeded);
    }

    #[test]
    fn test_unknown_task_rejected() {
        let mut agg = aggregator(&["a"]);
        let err = agg
            .record(TaskOutcome::new(id("zzz"), TaskState::Succeeded, Duration::ZERO, 1))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownTask(_)));
    }

    #[test]
    fn test_finalize_with_pending_outcomes() {
        let mut agg = aggregator(&["a", "b"]);
        agg.record(TaskOutcome::new(id("a"), TaskState::Succeeded, Duration::ZERO, 1))
            .unwrap();
        assert!(matches!(
            agg.finalize(),
            Err(SupervisorError::OutcomesPending { remaining: 1 })
        ));
    }
}
