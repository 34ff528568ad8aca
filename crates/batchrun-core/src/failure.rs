//! Failure categories and per-task failure history.

use crate::{CoreError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category assigned to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    /// Likely to succeed on retry (rate limits, network errors, timeouts).
    Transient,
    /// The environment was starved (out of memory, disk full).
    Resource,
    /// Anything else. Never retried.
    Permanent,
}

impl FailureCategory {
    /// Whether failures of this category may be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Resource)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed attempt of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub category: FailureCategory,
    /// Raw diagnostic text the category was derived from.
    pub diagnostic: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        category: FailureCategory,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            category,
            diagnostic: diagnostic.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only failure log of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureHistory {
    task_id: TaskId,
    records: Vec<FailureRecord>,
}

impl FailureHistory {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            records: Vec::new(),
        }
    }

    /// Append a record. Attempt numbers must strictly increase.
    pub fn push(&mut self, record: FailureRecord) -> Result<(), CoreError> {
        if record.task_id != self.task_id {
            return Err(CoreError::ForeignFailureRecord {
                expected: self.task_id.to_string(),
                got: record.task_id.to_string(),
            });
        }
        if let Some(last) = self.records.last() {
            if record.attempt <= last.attempt {
                return Err(CoreError::NonMonotonicAttempt {
                    task_id: self.task_id.to_string(),
                    attempt: record.attempt,
                    last: last.attempt,
                });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn last(&self) -> Option<&FailureRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<FailureRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn test_history_is_monotonic() {
        let mut history = FailureHistory::new(id("t"));
        history
            .push(FailureRecord::new(id("t"), 1, FailureCategory::Transient, "reset"))
            .unwrap();
        history
            .push(FailureRecord::new(id("t"), 2, FailureCategory::Transient, "reset"))
            .unwrap();

        let err = history
            .push(FailureRecord::new(id("t"), 2, FailureCategory::Transient, "again"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NonMonotonicAttempt { attempt: 2, last: 2, .. }));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_history_rejects_foreign_record() {
        let mut history = FailureHistory::new(id("a"));
        let err = history
            .push(FailureRecord::new(id("b"), 1, FailureCategory::Permanent, "x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::ForeignFailureRecord { .. }));
        assert!(history.is_empty());
    }

    #[test]
    fn test_category_serde() {
        let json = serde_json::to_string(&FailureCategory::Resource).unwrap();
        assert_eq!(json, "\"resource\"");
        assert!(FailureCategory::Resource.is_retryable());
        assert!(!FailureCategory::Permanent.is_retryable());
    }
}
