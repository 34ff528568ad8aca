//! Live per-task status.

use std::collections::HashMap;

use batchrun_core::{BatchId, FailureCategory, ProgressEvent, TaskId, TaskOutcome, TaskState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Live view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub state: TaskState,
    /// Current (or last) attempt number; 0 before the first admission.
    pub attempt: u32,
    /// Last phase reported by the worker.
    pub phase: Option<String>,
    pub pid: Option<u32>,
    /// Category of the most recent failed attempt.
    pub last_failure: Option<FailureCategory>,
    pub last_activity: DateTime<Utc>,
}

impl TaskStatus {
    fn queued(task_id: TaskId, batch_id: BatchId) -> Self {
        Self {
            task_id,
            batch_id,
            state: TaskState::Queued,
            attempt: 0,
            phase: None,
            pid: None,
            last_failure: None,
            last_activity: Utc::now(),
        }
    }
}

/// Point-in-time copy of the supervisor's live status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Tasks of all unfinished batches, ordered by task id.
    pub tasks: Vec<TaskStatus>,
    /// Workers running right now, across batches.
    pub active_workers: usize,
    /// Highest number of simultaneous workers since the supervisor started.
    pub peak_workers: usize,
    /// Effective concurrency limit.
    pub concurrency_limit: usize,
}

impl StatusSnapshot {
    /// Number of tasks in `state`.
    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| &t.task_id == task_id)
    }
}

/// Mutable table of task statuses. Owned by the supervisor registry.
#[derive(Debug, Default)]
pub struct StatusBoard {
    tasks: HashMap<TaskId, TaskStatus>,
}

impl StatusBoard {
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn register(&mut self, batch_id: &BatchId, task_id: TaskId) {
        self.tasks
            .insert(task_id.clone(), TaskStatus::queued(task_id, batch_id.clone()));
    }

    /// Forget every task of a batch.
    pub fn remove_batch(&mut self, batch_id: &BatchId) {
        self.tasks.retain(|_, status| &status.batch_id != batch_id);
    }

    pub fn mark_running(&mut self, task_id: &TaskId, attempt: u32, pid: Option<u32>) {
        self.update(task_id, |status| {
            status.state = TaskState::Running;
            status.attempt = attempt;
            status.pid = pid;
            status.phase = None;
        });
    }

    pub fn apply_event(&mut self, event: &ProgressEvent) {
        self.update(&event.task_id, |status| {
            if status.attempt == event.attempt {
                status.phase = Some(event.phase.clone());
            }
        });
    }

    pub fn mark_retry_pending(&mut self, task_id: &TaskId, category: FailureCategory) {
        self.update(task_id, |status| {
            status.state = TaskState::RetryPending;
            status.pid = None;
            status.last_failure = Some(category);
        });
    }

    pub fn mark_finished(&mut self, outcome: &TaskOutcome) {
        self.update(&outcome.task_id, |status| {
            status.state = outcome.final_state;
            status.attempt = outcome.attempt_count;
            status.pid = None;
            status.last_failure = outcome.category;
        });
    }

    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let mut tasks: Vec<TaskStatus> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks
    }

    fn update(&mut self, task_id: &TaskId, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(status) = self.tasks.get_mut(task_id) {
            f(status);
            status.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let batch = BatchId::generate();
        let mut board = StatusBoard::default();
        board.register(&batch, id("a"));
        assert!(board.contains(&id("a")));

        board.mark_running(&id("a"), 1, Some(42));
        let event = ProgressEvent {
            task_id: id("a"),
            attempt: 1,
            seq: 0,
            phase: "build".to_string(),
            timestamp: Utc::now(),
            error: None,
            artifact: None,
        };
        board.apply_event(&event);
        let snap = board.snapshot();
        assert_eq!(snap[0].state, TaskState::Running);
        assert_eq!(snap[0].phase.as_deref(), Some("build"));
        assert_eq!(snap[0].pid, Some(42));

        board.mark_retry_pending(&id("a"), FailureCategory::Transient);
        assert_eq!(board.snapshot()[0].state, TaskState::RetryPending);

        board.mark_finished(&TaskOutcome::new(id("a"), TaskState::Succeeded, Duration::ZERO, 2));
        let snap = board.snapshot();
        assert_eq!(snap[0].state, TaskState::Succeeded);
        assert_eq!(snap[0].attempt, 2);
        assert_eq!(snap[0].pid, None);
    }

    #[test]
    fn test_stale_attempt_event_ignored() {
        let batch = BatchId::generate();
        let mut board = StatusBoard::default();
        board.register(&batch, id("a"));
        board.mark_running(&id("a"), 2, None);
        board.apply_event(&ProgressEvent {
            task_id: id("a"),
            attempt: 1,
            seq: 7,
            phase: "late".to_string(),
            timestamp: Utc::now(),
            error: None,
            artifact: None,
        });
        assert_eq!(board.snapshot()[0].phase, None);
    }

    #[test]
    fn test_remove_batch() {
        let (b1, b2) = (BatchId::generate(), BatchId::generate());
        let mut board = StatusBoard::default();
        board.register(&b1, id("a"));
        board.register(&b2, id("b"));
        board.remove_batch(&b1);
        assert!(!board.contains(&id("a")));
        assert!(board.contains(&id("b")));
    }
}
