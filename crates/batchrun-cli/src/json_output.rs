//! JSON output for streaming batch events to stdout.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use batchrun_core::{AggregateReport, ProgressEvent, TaskState};
use batchrun_supervisor::{StatusSnapshot, SupervisorEvent};

/// Global flag to enable JSON output mode.
static JSON_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable JSON output mode.
pub fn enable_json_mode() {
    JSON_MODE_ENABLED.store(true, Ordering::SeqCst);
}

/// Check if JSON mode is enabled.
pub fn is_json_mode() -> bool {
    JSON_MODE_ENABLED.load(Ordering::SeqCst)
}

/// JSON event types that can be emitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    BatchStarted,
    TaskStarted,
    Progress,
    TaskRetrying,
    TaskFinished,
    Status,
    BatchFinished,
    Error,
}

/// A JSON event to be output to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: JsonEventType, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Output this event as a JSON line to stdout.
    pub fn emit(&self) {
        if !is_json_mode() {
            return;
        }
        if let Ok(json) = serde_json::to_string(self) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

/// Emit a batch_started event.
pub fn emit_batch_started(batch_id: &str, tasks: usize, concurrency_limit: usize) {
    JsonEvent::new(
        JsonEventType::BatchStarted,
        serde_json::json!({
            "batch_id": batch_id,
            "tasks": tasks,
            "concurrency_limit": concurrency_limit,
        }),
    )
    .emit();
}

/// Emit the JSON form of a supervisor notification.
pub fn emit_supervisor_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::TaskStarted {
            batch_id,
            task_id,
            attempt,
            pid,
        } => JsonEvent::new(
            JsonEventType::TaskStarted,
            serde_json::json!({
                "batch_id": batch_id.as_str(),
                "task_id": task_id.as_str(),
                "attempt": attempt,
                "pid": pid,
            }),
        )
        .emit(),
        SupervisorEvent::Progress(progress) => emit_progress(progress),
        SupervisorEvent::TaskRetrying {
            batch_id,
            task_id,
            attempt,
            category,
            delay,
        } => JsonEvent::new(
            JsonEventType::TaskRetrying,
            serde_json::json!({
                "batch_id": batch_id.as_str(),
                "task_id": task_id.as_str(),
                "attempt": attempt,
                "category": category,
                "delay_ms": delay.as_millis() as u64,
            }),
        )
        .emit(),
        SupervisorEvent::TaskFinished {
            batch_id,
            task_id,
            state,
            attempts,
        } => JsonEvent::new(
            JsonEventType::TaskFinished,
            serde_json::json!({
                "batch_id": batch_id.as_str(),
                "task_id": task_id.as_str(),
                "state": state,
                "attempts": attempts,
            }),
        )
        .emit(),
    }
}

/// Emit a progress event as reported by a worker.
pub fn emit_progress(progress: &ProgressEvent) {
    if let Ok(data) = serde_json::to_value(progress) {
        JsonEvent::new(JsonEventType::Progress, data).emit();
    }
}

/// Emit a status event with per-state counts.
pub fn emit_status(snapshot: &StatusSnapshot) {
    let counts: serde_json::Map<String, serde_json::Value> = TaskState::ALL
        .iter()
        .map(|state| (state.as_str().to_string(), snapshot.count(*state).into()))
        .collect();
    JsonEvent::new(
        JsonEventType::Status,
        serde_json::json!({
            "active_workers": snapshot.active_workers,
            "concurrency_limit": snapshot.concurrency_limit,
            "tasks": counts,
        }),
    )
    .emit();
}

/// Emit a batch_finished event carrying the summary block.
pub fn emit_batch_finished(report: &AggregateReport) {
    JsonEvent::new(
        JsonEventType::BatchFinished,
        serde_json::json!({
            "batch_id": report.batch_id.as_str(),
            "summary": report.summary,
        }),
    )
    .emit();
}

/// Emit an error event.
pub fn emit_error(message: &str) {
    JsonEvent::new(
        JsonEventType::Error,
        serde_json::json!({
            "message": message,
        }),
    )
    .emit();
}
