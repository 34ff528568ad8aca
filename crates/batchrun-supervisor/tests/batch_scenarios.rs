//! End-to-end batch runs against `/bin/sh` workers.
#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batchrun_core::{FailureCategory, Task, TaskId, TaskState};
use batchrun_supervisor::{
    DirectoryProvisioner, FixedMonitor, ResourceMonitor, ResourceSnapshot, Supervisor,
    SupervisorConfig, SupervisorEvent, WorkerCommand, WorkspaceError, WorkspaceHandle,
    WorkspaceProvisioner,
};
use serde_json::json;

fn sh(script: &str) -> WorkerCommand {
    WorkerCommand::new("/bin/sh").arg("-c").arg(script)
}

fn tasks(ids: &[&str]) -> Vec<Task> {
    ids.iter()
        .map(|id| Task::new(TaskId::new(*id).unwrap(), json!({ "id": id })))
        .collect()
}

fn numbered(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(TaskId::new(format!("task-{i:02}")).unwrap(), json!(i)))
        .collect()
}

fn config(max_concurrency: usize) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        max_concurrency: Some(max_concurrency),
        tick: Duration::from_millis(20),
        cancel_grace: Duration::from_millis(500),
        ..SupervisorConfig::default()
    };
    config.retry.base_delay = Duration::from_millis(20);
    config.retry.max_delay = Duration::from_millis(100);
    config
}

fn supervisor(config: SupervisorConfig, command: WorkerCommand, root: &Path) -> Supervisor {
    Supervisor::builder(config, command)
        .with_provisioner(Arc::new(DirectoryProvisioner::new(root)))
        .with_monitor(Arc::new(FixedMonitor::idle()))
        .build()
        .unwrap()
}

fn id(s: &str) -> TaskId {
    TaskId::new(s).unwrap()
}

fn leftover_workspaces(root: &Path) -> usize {
    std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_ten_tasks_with_ceiling_three() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor(config(3), sh("sleep 0.1"), root.path());

    let batch = sup.submit(numbered(10)).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    assert_eq!(report.outcomes.len(), 10);
    assert_eq!(report.summary.succeeded, 10);
    assert_eq!(report.summary.concurrency_achieved, 3);
    assert!(
        report.summary.total_duration_ms >= 400,
        "four waves of 100ms cannot finish in {}ms",
        report.summary.total_duration_ms
    );
    assert!(report
        .outcomes
        .values()
        .all(|o| o.final_state == TaskState::Succeeded && o.attempt_count == 1));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_transient_failure_exhausts_retries() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor(
        config(2),
        sh("echo 'curl: (7) connection refused' >&2; exit 1"),
        root.path(),
    );

    let batch = sup.submit(tasks(&["flaky"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("flaky")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Failed);
    assert_eq!(outcome.attempt_count, 3);
    assert_eq!(outcome.failures.len(), 3);
    assert!(outcome
        .failures
        .iter()
        .all(|f| f.category == FailureCategory::Transient));
    let attempts: Vec<u32> = outcome.failures.iter().map(|f| f.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(outcome.category, Some(FailureCategory::Transient));
    assert!(outcome.diagnostic.as_deref().unwrap().contains("connection refused"));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_success_on_third_attempt() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"
        echo '{"phase": "start"}'
        if [ "$BATCHRUN_ATTEMPT" -lt 3 ]; then
            echo 'HTTP 429: rate limit exceeded' >&2
            exit 1
        fi
        echo '{"phase": "done", "artifact": "result.json"}'
    "#;
    let sup = supervisor(config(2), sh(script), root.path());

    let batch = sup.submit(tasks(&["eventually"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("eventually")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Succeeded);
    assert_eq!(outcome.attempt_count, 3);
    assert_eq!(outcome.failures.len(), 2);
    assert_eq!(outcome.output_artifact.as_deref(), Some("result.json"));
    assert_eq!(report.summary.succeeded_after_retry, 1);
    assert_eq!(report.summary.total_attempts, 3);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor(
        config(2),
        sh("echo 'error: invalid manifest' >&2; exit 2"),
        root.path(),
    );

    let batch = sup.submit(tasks(&["broken"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("broken")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Failed);
    assert_eq!(outcome.attempt_count, 1);
    assert_eq!(outcome.category, Some(FailureCategory::Permanent));
}

#[tokio::test]
async fn test_resource_failure_is_requeued() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"
        if [ "$BATCHRUN_ATTEMPT" -lt 2 ]; then
            echo 'fatal: Cannot allocate memory' >&2
            exit 1
        fi
    "#;
    let sup = supervisor(config(2), sh(script), root.path());

    let batch = sup.submit(tasks(&["hungry"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("hungry")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Succeeded);
    assert_eq!(outcome.failures[0].category, FailureCategory::Resource);
}

#[tokio::test]
async fn test_sigkilled_worker_is_resource_failure() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"
        if [ "$BATCHRUN_ATTEMPT" -lt 2 ]; then
            kill -9 $$
        fi
    "#;
    let sup = supervisor(config(2), sh(script), root.path());

    let batch = sup.submit(tasks(&["oom-killed"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("oom-killed")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Succeeded);
    assert_eq!(outcome.attempt_count, 2);
    assert_eq!(outcome.failures[0].category, FailureCategory::Resource);
    assert_eq!(outcome.failures[0].diagnostic, "terminated by signal 9");
}

#[tokio::test]
async fn test_spawn_failure_becomes_outcome() {
    let root = tempfile::tempdir().unwrap();
    let sup = supervisor(
        config(2),
        WorkerCommand::new("/nonexistent/batchrun-worker"),
        root.path(),
    );

    let batch = sup.submit(tasks(&["a", "b"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    assert_eq!(report.summary.failed, 2);
    let outcome = report.outcome(&id("a")).unwrap();
    assert_eq!(outcome.attempt_count, 1);
    assert_eq!(outcome.category, Some(FailureCategory::Permanent));
    assert_eq!(leftover_workspaces(root.path()), 0);
}

#[tokio::test]
async fn test_malformed_progress_does_not_abort() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"
        echo '{"phase": "one"}'
        echo '{"no_phase": true}'
        echo '{not json'
        echo 'free text'
        echo '{"phase": "two"}'
    "#;
    let sup = supervisor(config(1), sh(script), root.path());
    let mut events = sup.subscribe();

    let batch = sup.submit(tasks(&["noisy"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();
    assert!(report.all_succeeded());

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::Progress(progress) = event {
            phases.push((progress.seq, progress.phase));
        }
    }
    assert_eq!(phases, vec![(0, "one".to_string()), (1, "two".to_string())]);
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let root = tempfile::tempdir().unwrap();
    let mut cfg = config(1);
    cfg.heartbeat_timeout = Duration::from_millis(300);
    cfg.retry.max_attempts = 1;
    let sup = supervisor(cfg, sh("echo '{\"phase\": \"stuck\"}'; sleep 30"), root.path());

    let started = Instant::now();
    let batch = sup.submit(tasks(&["silent"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    let outcome = report.outcome(&id("silent")).unwrap();
    assert_eq!(outcome.final_state, TaskState::TimedOut);
    assert_eq!(outcome.category, Some(FailureCategory::Transient));
    assert_eq!(report.summary.timed_out, 1);
    assert_eq!(report.summary.failed, 1);
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let root = tempfile::tempdir().unwrap();
    let script = r#"
        case "$BATCHRUN_TASK_ID" in
            fast) exit 0 ;;
            *) sleep 30 ;;
        esac
    "#;
    let sup = Arc::new(supervisor(config(2), sh(script), root.path()));
    let batch = sup
        .submit(tasks(&["fast", "slow-1", "slow-2", "slow-3"]))
        .await
        .unwrap();

    let runner = {
        let sup = sup.clone();
        let batch = batch.clone();
        tokio::spawn(async move { sup.run(&batch).await })
    };

    // Wait until the fast task is done and both slots hold slow workers.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = sup.status().await;
        if status.count(TaskState::Succeeded) == 1 && status.count(TaskState::Running) == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "batch never reached steady state");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancelled_at = Instant::now();
    sup.cancel(&batch).await.unwrap();
    let report = runner.await.unwrap().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_millis(500) + Duration::from_secs(2));

    assert_eq!(report.outcomes.len(), 4);
    assert_eq!(report.outcome(&id("fast")).unwrap().final_state, TaskState::Succeeded);
    for slow in ["slow-1", "slow-2", "slow-3"] {
        assert_eq!(report.outcome(&id(slow)).unwrap().final_state, TaskState::Cancelled);
    }
    assert_eq!(report.outcome(&id("slow-3")).unwrap().attempt_count, 0);
    assert_eq!(report.summary.cancelled, 3);
    assert_eq!(sup.status().await.active_workers, 0);
    assert_eq!(leftover_workspaces(root.path()), 0);
}

/// Reports an overloaded machine until `busy_for` has elapsed.
struct ScriptedMonitor {
    start: Instant,
    busy_for: Duration,
}

impl ResourceMonitor for ScriptedMonitor {
    fn sample(&self) -> ResourceSnapshot {
        let busy = self.start.elapsed() < self.busy_for;
        ResourceSnapshot {
            cpu_percent: if busy { 100.0 } else { 5.0 },
            ..ResourceSnapshot::idle()
        }
    }
}

#[tokio::test]
async fn test_throttle_pauses_admission() {
    let root = tempfile::tempdir().unwrap();
    let start = Instant::now();
    let sup = Supervisor::builder(config(2), sh("exit 0"))
        .with_provisioner(Arc::new(DirectoryProvisioner::new(root.path())))
        .with_monitor(Arc::new(ScriptedMonitor {
            start,
            busy_for: Duration::from_secs(2),
        }))
        .build()
        .unwrap();
    let sup = Arc::new(sup);

    let batch = sup.submit(numbered(3)).await.unwrap();
    let runner = {
        let sup = sup.clone();
        let batch = batch.clone();
        tokio::spawn(async move { sup.run(&batch).await })
    };

    while start.elapsed() < Duration::from_millis(1800) {
        let status = sup.status().await;
        assert!(
            status.tasks.iter().all(|t| t.attempt == 0),
            "task admitted while throttled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = runner.await.unwrap().unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(report.summary.succeeded, 3);
}

#[tokio::test]
async fn test_concurrent_batches_share_ceiling() {
    let root = tempfile::tempdir().unwrap();
    let sup = Arc::new(supervisor(config(2), sh("sleep 0.1"), root.path()));

    let first = sup.submit(tasks(&["a1", "a2", "a3"])).await.unwrap();
    let second = sup.submit(tasks(&["b1", "b2", "b3"])).await.unwrap();

    let runners: Vec<_> = [first, second]
        .into_iter()
        .map(|batch| {
            let sup = sup.clone();
            tokio::spawn(async move { sup.run(&batch).await })
        })
        .collect();

    for runner in runners {
        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.summary.succeeded, 3);
        assert!(report.summary.concurrency_achieved <= 2);
    }
    assert!(sup.status().await.peak_workers <= 2);
}

/// Provisioner that never has room.
struct FullProvisioner;

#[async_trait]
impl WorkspaceProvisioner for FullProvisioner {
    async fn acquire(&self, _task_id: &TaskId) -> Result<WorkspaceHandle, WorkspaceError> {
        Err(WorkspaceError::Unavailable("no free slots".to_string()))
    }

    async fn release(&self, _handle: WorkspaceHandle) -> Result<(), WorkspaceError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_workspace_failure_is_permanent() {
    let sup = Supervisor::builder(config(2), sh("exit 0"))
        .with_provisioner(Arc::new(FullProvisioner))
        .with_monitor(Arc::new(FixedMonitor::idle()))
        .build()
        .unwrap();

    let batch = sup.submit(tasks(&["x"])).await.unwrap();
    let report = sup.run(&batch).await.unwrap();

    let outcome = report.outcome(&id("x")).unwrap();
    assert_eq!(outcome.final_state, TaskState::Failed);
    assert_eq!(outcome.attempt_count, 1);
    assert_eq!(outcome.category, Some(FailureCategory::Permanent));
    assert!(outcome.diagnostic.as_deref().unwrap().contains("no free slots"));
}
