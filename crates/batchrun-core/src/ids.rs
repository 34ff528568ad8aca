//! Newtype wrappers for identifiers to ensure type safety.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a Task, supplied by the work item source.
///
/// Task ids are caller-chosen strings; they must be non-empty and unique
/// within a batch and across batches that are still running.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Create a TaskId, rejecting blank ids.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::InvalidTaskId(id));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<&str> for TaskId {
    type Error = CoreError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Identifier of a submitted batch. Always generated by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    /// Generate a new random BatchId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_generate() {
        let id1 = BatchId::generate();
        let id2 = BatchId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new("test-123").unwrap();
        assert_eq!(format!("{}", id), "test-123");
    }

    #[test]
    fn test_task_id_rejects_blank() {
        assert!(matches!(TaskId::new(""), Err(CoreError::InvalidTaskId(_))));
        assert!(matches!(TaskId::new("   "), Err(CoreError::InvalidTaskId(_))));
    }

    #[test]
    fn test_task_id_deserialize_validates() {
        let ok: TaskId = serde_json::from_str("\"build-7\"").unwrap();
        assert_eq!(ok.as_str(), "build-7");
        assert!(serde_json::from_str::<TaskId>("\"\"").is_err());
    }
}
