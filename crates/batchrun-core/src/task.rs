//! Task types.

use crate::{CoreError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Task is one independent unit of work in a batch.
///
/// The payload is opaque to the supervisor; it is handed to the worker
/// program verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Work descriptor handed to the worker.
    pub payload: serde_json::Value,

    /// Declared resource hints.
    #[serde(default)]
    pub hints: ResourceHints,

    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new Task.
    pub fn new(id: TaskId, payload: serde_json::Value) -> Self {
        Self {
            id,
            payload,
            hints: ResourceHints::default(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to attach resource hints.
    pub fn with_hints(mut self, hints: ResourceHints) -> Self {
        self.hints = hints;
        self
    }

    /// Payload rendered as compact JSON, as passed to workers.
    pub fn payload_json(&self) -> String {
        self.payload.to_string()
    }
}

/// Optional resource hints a task may declare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Expected peak memory in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// Expected number of busy CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f32>,

    /// Expected wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_secs: Option<u64>,
}

/// Task as described by a work item source (e.g. one entry of a tasks file).
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub hints: ResourceHints,
}

impl TaskSpec {
    /// Validate the entry and turn it into a Task.
    pub fn into_task(self) -> Result<Task, CoreError> {
        let id = TaskId::new(self.id)?;
        Ok(Task::new(id, self.payload).with_hints(self.hints))
    }

    /// Parse a JSON array of task specs into tasks.
    pub fn parse_list(json: &str) -> Result<Vec<Task>, CoreError> {
        let specs: Vec<TaskSpec> = serde_json::from_str(json)?;
        specs.into_iter().map(TaskSpec::into_task).collect()
    }
}
