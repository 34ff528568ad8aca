//! Prometheus text rendering of the live status.

use std::fmt::Write;

use batchrun_core::TaskState;

use crate::status::StatusSnapshot;

/// Format a status snapshot in Prometheus text exposition format.
pub fn render(snapshot: &StatusSnapshot) -> String {
    let mut output = String::new();
    render_task_metrics(snapshot, &mut output);
    render_worker_metrics(snapshot, &mut output);
    output
}

fn render_task_metrics(snapshot: &StatusSnapshot, output: &mut String) {
    writeln!(
        output,
        "# HELP batchrun_tasks Number of tasks in unfinished batches by state"
    )
    .ok();
    writeln!(output, "# TYPE batchrun_tasks gauge").ok();
    for state in TaskState::ALL {
        let count = snapshot.count(state);
        writeln!(output, "batchrun_tasks{{state=\"{state}\"}} {count}").ok();
    }

    let attempts: u64 = snapshot.tasks.iter().map(|t| u64::from(t.attempt)).sum();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP batchrun_task_attempts Attempts started by tasks in unfinished batches"
    )
    .ok();
    writeln!(output, "# TYPE batchrun_task_attempts gauge").ok();
    writeln!(output, "batchrun_task_attempts {attempts}").ok();
}

fn render_worker_metrics(snapshot: &StatusSnapshot, output: &mut String) {
    writeln!(output).ok();
    writeln!(output, "# HELP batchrun_workers_active Worker processes running now").ok();
    writeln!(output, "# TYPE batchrun_workers_active gauge").ok();
    writeln!(output, "batchrun_workers_active {}", snapshot.active_workers).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP batchrun_workers_peak Highest number of simultaneous worker processes"
    )
    .ok();
    writeln!(output, "# TYPE batchrun_workers_peak gauge").ok();
    writeln!(output, "batchrun_workers_peak {}", snapshot.peak_workers).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP batchrun_workers_limit Effective concurrency limit"
    )
    .ok();
    writeln!(output, "# TYPE batchrun_workers_limit gauge").ok();
    writeln!(output, "batchrun_workers_limit {}", snapshot.concurrency_limit).ok();
}
