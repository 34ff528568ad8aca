//! Progress events reported by worker programs.
//!
//! Workers write newline-delimited JSON records to stdout:
//!
//! ```text
//! {"phase": "checkout"}
//! {"phase": "test", "error": "2 tests failed"}
//! {"phase": "done", "artifact": "s3://bucket/result.tar"}
//! ```
//!
//! Every other line is raw diagnostic output.

use crate::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A structured progress record as written by a worker on one stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Name of the phase the worker entered.
    pub phase: String,

    /// Error the worker wants to surface for this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Reference to an output artifact produced so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Worker-side timestamp; the reader's clock is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Classification of a single worker output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// A well-formed progress record.
    Record(ProgressRecord),
    /// Free-form output, kept as diagnostic text.
    Raw(String),
    /// Looked like a record but could not be understood.
    Malformed { line: String, reason: String },
}

impl ProgressLine {
    /// Classify one line of worker stdout.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Self::Raw(trimmed.to_string());
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                return Self::Malformed {
                    line: trimmed.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        if !value.get("phase").is_some_and(|p| p.is_string()) {
            return Self::Malformed {
                line: trimmed.to_string(),
                reason: "missing string field `phase`".to_string(),
            };
        }

        match serde_json::from_value::<ProgressRecord>(value) {
            Ok(record) => Self::Record(record),
            Err(e) => Self::Malformed {
                line: trimmed.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// A progress event attributed to a task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Task this event belongs to.
    pub task_id: TaskId,
    /// Attempt number (1-based) that emitted the event.
    pub attempt: u32,
    /// Position in the attempt's event sequence, starting at 0.
    pub seq: u64,
    /// Phase name reported by the worker.
    pub phase: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Optional error reported with the phase.
    pub error: Option<String>,
    /// Optional artifact reference reported with the phase.
    pub artifact: Option<String>,
}

impl ProgressEvent {
    /// Attribute a parsed record to a task attempt.
    pub fn from_record(task_id: TaskId, attempt: u32, seq: u64, record: ProgressRecord) -> Self {
        Self {
            task_id,
            attempt,
            seq,
            phase: record.phase,
            timestamp: record.timestamp.unwrap_or_else(Utc::now),
            error: record.error,
            artifact: record.artifact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let line = ProgressLine::parse(r#"{"phase": "build", "error": "flaky"}"#);
        match line {
            ProgressLine::Record(record) => {
                assert_eq!(record.phase, "build");
                assert_eq!(record.error.as_deref(), Some("flaky"));
                assert!(record.artifact.is_none());
            }
            other => panic!("Expected Record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_raw_text() {
        let line = ProgressLine::parse("Compiling foo v0.1.0\n");
        assert_eq!(line, ProgressLine::Raw("Compiling foo v0.1.0".to_string()));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            ProgressLine::parse("{not json"),
            ProgressLine::Malformed { .. }
        ));
        assert!(matches!(
            ProgressLine::parse(r#"{"step": "build"}"#),
            ProgressLine::Malformed { .. }
        ));
        assert!(matches!(
            ProgressLine::parse(r#"{"phase": 3}"#),
            ProgressLine::Malformed { .. }
        ));
    }

    #[test]
    fn test_from_record_keeps_worker_timestamp() {
        let ts: DateTime<Utc> = "2025-01-02T03:04:05Z".parse().unwrap();
        let record = ProgressRecord {
            phase: "done".to_string(),
            error: None,
            artifact: Some("out/report.html".to_string()),
            timestamp: Some(ts),
        };
        let event = ProgressEvent::from_record(TaskId::new("t1").unwrap(), 2, 5, record);

        assert_eq!(event.timestamp, ts);
        assert_eq!(event.attempt, 2);
        assert_eq!(event.seq, 5);
        assert_eq!(event.artifact.as_deref(), Some("out/report.html"));
    }
}
