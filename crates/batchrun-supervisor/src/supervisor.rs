//! Batch orchestration.
//!
//! The [`Supervisor`] owns batches from submission to report. Each call to
//! [`Supervisor::run`] drives one batch with a single control loop: it admits
//! queued tasks while capacity and system headroom allow, forwards progress
//! from per-worker driver tasks, and reaps finished attempts into retries or
//! final outcomes. Only the control loop mutates the queue and the outcomes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use batchrun_core::{
    AggregateReport, BatchId, FailureCategory, FailureHistory, FailureRecord, ProgressEvent, Task,
    TaskId, TaskOutcome, TaskState, WorkerState,
};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::ResultAggregator;
use crate::classifier::{FailureClassifier, PatternClassifier};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::monitor::{should_throttle, ResourceMonitor, ResourceSnapshot, SystemMonitor};
use crate::process::{
    Heartbeat, SignalKind, SpawnOptions, WorkerCommand, WorkerError, WorkerExit, WorkerProcess,
    WorkerSignal,
};
use crate::retry::RetryPolicy;
use crate::status::{StatusBoard, StatusSnapshot};
use crate::workspace::{DirectoryProvisioner, WorkspaceLease, WorkspaceProvisioner};

/// Capacity of the supervisor event channel.
const EVENT_CAPACITY: usize = 1024;

/// Reference to a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    id: BatchId,
    task_count: usize,
}

impl BatchHandle {
    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }
}

/// Notifications published while batches run.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A worker attempt was spawned.
    TaskStarted {
        batch_id: BatchId,
        task_id: TaskId,
        attempt: u32,
        pid: Option<u32>,
    },
    /// A worker reported progress.
    Progress(ProgressEvent),
    /// An attempt failed and the task was requeued.
    TaskRetrying {
        batch_id: BatchId,
        task_id: TaskId,
        attempt: u32,
        category: FailureCategory,
        delay: Duration,
    },
    /// A task reached its terminal state.
    TaskFinished {
        batch_id: BatchId,
        task_id: TaskId,
        state: TaskState,
        attempts: u32,
    },
}

/// Supervisor-wide count of running workers.
///
/// Slots are reserved with compare-and-swap so that concurrent batches on
/// one supervisor never exceed the limit together.
#[derive(Debug)]
struct ConcurrencyGauge {
    limit: usize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// One reserved gauge slot; released on drop.
#[derive(Debug)]
struct Slot {
    gauge: Arc<ConcurrencyGauge>,
}

impl Slot {
    fn reserve(gauge: &Arc<ConcurrencyGauge>) -> Option<Self> {
        let previous = gauge
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < gauge.limit).then_some(n + 1)
            })
            .ok()?;
        gauge.peak.fetch_max(previous + 1, Ordering::SeqCst);
        Some(Self {
            gauge: gauge.clone(),
        })
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BatchEntry {
    /// Taken when the batch starts running.
    tasks: Option<Vec<Task>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    batches: HashMap<BatchId, BatchEntry>,
    board: StatusBoard,
}

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    command: WorkerCommand,
    provisioner: Option<Arc<dyn WorkspaceProvisioner>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
}

impl SupervisorBuilder {
    /// Workspace provisioner. Defaults to directories under the system temp dir.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Resource monitor. Defaults to a [`SystemMonitor`].
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Failure classifier. Defaults to a [`PatternClassifier`] built from the config.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validate the configuration and build the supervisor.
    ///
    /// Must be called inside a Tokio runtime when no monitor was given.
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        self.config.validate()?;

        let classifier: Arc<dyn FailureClassifier> = match self.classifier {
            Some(classifier) => classifier,
            None => Arc::new(PatternClassifier::from_config(&self.config.classifier)?),
        };
        let provisioner: Arc<dyn WorkspaceProvisioner> = match self.provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(DirectoryProvisioner::new(default_workspace_root())),
        };
        let monitor: Arc<dyn ResourceMonitor> = match self.monitor {
            Some(monitor) => monitor,
            None => SystemMonitor::spawn(self.config.throttle.sample_interval),
        };

        let limit = self.config.effective_concurrency();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            concurrency_limit = limit,
            max_attempts = self.config.retry.max_attempts,
            program = %self.command.program(),
            "Supervisor ready"
        );

        Ok(Supervisor {
            retry: RetryPolicy::new(&self.config.retry),
            config: self.config,
            command: self.command,
            provisioner,
            monitor,
            classifier,
            gauge: Arc::new(ConcurrencyGauge::new(limit)),
            registry: RwLock::new(Registry::default()),
            events,
        })
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("batchrun-workspaces")
}

/// Runs batches of tasks through a worker program.
pub struct Supervisor {
    config: SupervisorConfig,
    command: WorkerCommand,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    monitor: Arc<dyn ResourceMonitor>,
    classifier: Arc<dyn FailureClassifier>,
    retry: RetryPolicy,
    gauge: Arc<ConcurrencyGauge>,
    registry: RwLock<Registry>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    pub fn builder(config: SupervisorConfig, command: WorkerCommand) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            command,
            provisioner: None,
            monitor: None,
            classifier: None,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Effective number of workers that may run at once.
    pub fn concurrency_limit(&self) -> usize {
        self.gauge.limit
    }

    /// Subscribe to lifecycle and progress notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Register a batch.
    ///
    /// Task ids must be unique within the batch and must not belong to a
    /// batch that has not finished yet.
    pub async fn submit(&self, tasks: Vec<Task>) -> Result<BatchHandle, SupervisorError> {
        if tasks.is_empty() {
            return Err(SupervisorError::EmptyBatch);
        }
        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !seen.insert(&task.id) {
                return Err(SupervisorError::DuplicateTaskId(task.id.clone()));
            }
        }

        let mut registry = self.registry.write().await;
        if let Some(task) = tasks.iter().find(|t| registry.board.contains(&t.id)) {
            return Err(SupervisorError::DuplicateTaskId(task.id.clone()));
        }

        let batch_id = BatchId::generate();
        for task in &tasks {
            registry.board.register(&batch_id, task.id.clone());
        }
        let task_count = tasks.len();
        registry.batches.insert(
            batch_id.clone(),
            BatchEntry {
                tasks: Some(tasks),
                cancel: CancellationToken::new(),
            },
        );

        info!(batch_id = %batch_id, tasks = task_count, "Batch submitted");
        Ok(BatchHandle {
            id: batch_id,
            task_count,
        })
    }

    /// Run a submitted batch to completion.
    ///
    /// Per-task failures end up in the report; only batch-level errors and
    /// invariant violations are returned as `Err`.
    pub async fn run(&self, batch: &BatchHandle) -> Result<AggregateReport, SupervisorError> {
        let (tasks, cancel) = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .batches
                .get_mut(&batch.id)
                .ok_or_else(|| SupervisorError::UnknownBatch(batch.id.clone()))?;
            let tasks = entry
                .tasks
                .take()
                .ok_or_else(|| SupervisorError::BatchAlreadyStarted(batch.id.clone()))?;
            (tasks, entry.cancel.clone())
        };

        match self.provisioner.recover_stale().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Recovered stale workspaces"),
            Err(e) => warn!(error = %e, "Stale workspace recovery failed"),
        }

        let result = BatchRun::new(self, batch.id.clone(), tasks, cancel).run().await;

        let mut registry = self.registry.write().await;
        registry.batches.remove(&batch.id);
        registry.board.remove_batch(&batch.id);

        match &result {
            Ok(report) => info!(
                batch_id = %batch.id,
                succeeded = report.summary.succeeded,
                failed = report.summary.failed,
                cancelled = report.summary.cancelled,
                duration_ms = report.summary.total_duration_ms,
                peak_concurrency = report.summary.concurrency_achieved,
                "Batch finished"
            ),
            Err(e) => error!(batch_id = %batch.id, error = %e, "Batch aborted"),
        }
        result
    }

    /// Request cooperative cancellation of a batch.
    ///
    /// Safe to call while `run` is in progress. Queued tasks become
    /// `Cancelled`; running workers are terminated after the grace period.
    pub async fn cancel(&self, batch: &BatchHandle) -> Result<(), SupervisorError> {
        let registry = self.registry.read().await;
        let entry = registry
            .batches
            .get(&batch.id)
            .ok_or_else(|| SupervisorError::UnknownBatch(batch.id.clone()))?;
        if !entry.cancel.is_cancelled() {
            info!(batch_id = %batch.id, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Live status of every task in unfinished batches.
    pub async fn status(&self) -> StatusSnapshot {
        let registry = self.registry.read().await;
        StatusSnapshot {
            taken_at: Utc::now(),
            tasks: registry.board.snapshot(),
            active_workers: self.gauge.active(),
            peak_workers: self.gauge.peak(),
            concurrency_limit: self.gauge.limit,
        }
    }

    fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            grace: self.config.cancel_grace,
            tail_lines: self.config.diagnostic_tail_lines,
        }
    }

    fn publish(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Messages from worker driver tasks to the control loop.
enum WorkerMessage {
    Event(ProgressEvent),
    Exited {
        task_id: TaskId,
        attempt: u32,
        result: Result<WorkerExit, WorkerError>,
    },
}

/// Per-task bookkeeping inside a running batch.
struct TaskEntry {
    task: Task,
    attempts: u32,
    history: FailureHistory,
    /// Held from the first admission until the task is final.
    lease: Option<WorkspaceLease>,
    first_started: Option<Instant>,
    artifact: Option<String>,
}

/// A queued task waiting for admission.
struct Pending {
    task_id: TaskId,
    not_before: Option<Instant>,
    /// Set after a resource failure: only a sample taken after this instant
    /// can readmit the task.
    awaiting_headroom_since: Option<Instant>,
}

impl Pending {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            not_before: None,
            awaiting_headroom_since: None,
        }
    }

    fn is_eligible(&self, now: Instant, snapshot: &ResourceSnapshot) -> bool {
        self.not_before.map_or(true, |at| at <= now)
            && self
                .awaiting_headroom_since
                .map_or(true, |since| snapshot.sampled_at > since)
    }
}

struct ActiveWorker {
    attempt: u32,
    signal: WorkerSignal,
    heartbeat: Arc<Heartbeat>,
    timed_out: bool,
    _slot: Slot,
}

enum Wake {
    Message(WorkerMessage),
    Cancelled,
    Tick,
}

/// State of one `run` call.
struct BatchRun<'a> {
    sup: &'a Supervisor,
    batch_id: BatchId,
    cancel: CancellationToken,
    cancelling: bool,
    throttled: bool,
    entries: HashMap<TaskId, TaskEntry>,
    queue: VecDeque<Pending>,
    active: HashMap<TaskId, ActiveWorker>,
    drivers: JoinSet<()>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    aggregator: ResultAggregator,
}

impl<'a> BatchRun<'a> {
    fn new(sup: &'a Supervisor, batch_id: BatchId, tasks: Vec<Task>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = ResultAggregator::new(batch_id.clone(), tasks.iter().map(|t| t.id.clone()));
        let queue = tasks.iter().map(|t| Pending::new(t.id.clone())).collect();
        let entries = tasks
            .into_iter()
            .map(|task| {
                let entry = TaskEntry {
                    history: FailureHistory::new(task.id.clone()),
                    task,
                    attempts: 0,
                    lease: None,
                    first_started: None,
                    artifact: None,
                };
                (entry.task.id.clone(), entry)
            })
            .collect();

        Self {
            sup,
            batch_id,
            cancel,
            cancelling: false,
            throttled: false,
            entries,
            queue,
            active: HashMap::new(),
            drivers: JoinSet::new(),
            tx,
            rx,
            aggregator,
        }
    }

    async fn run(mut self) -> Result<AggregateReport, SupervisorError> {
        info!(
            batch_id = %self.batch_id,
            tasks = self.queue.len(),
            concurrency_limit = self.sup.gauge.limit,
            "Batch started"
        );

        loop {
            if !self.cancelling && self.cancel.is_cancelled() {
                self.begin_cancel().await?;
            }
            if !self.cancelling {
                self.admit().await?;
            }
            self.check_heartbeats();
            self.aggregator.observe_concurrency(self.active.len());

            if self.aggregator.is_complete() && self.active.is_empty() {
                break;
            }

            let wait = self.next_wake();
            let watch_cancel = !self.cancelling;
            let wake = tokio::select! {
                Some(message) = self.rx.recv() => Wake::Message(message),
                _ = self.cancel.cancelled(), if watch_cancel => Wake::Cancelled,
                _ = tokio::time::sleep(wait) => Wake::Tick,
            };

            match wake {
                Wake::Message(message) => self.handle(message).await?,
                Wake::Cancelled | Wake::Tick => {}
            }
            while let Ok(message) = self.rx.try_recv() {
                self.handle(message).await?;
            }
            self.reap_drivers();
        }

        self.aggregator.finalize()
    }

    /// Sleep until the next backoff expires, bounded by the scheduling tick.
    fn next_wake(&self) -> Duration {
        let tick = self.sup.config.tick;
        let now = Instant::now();
        self.queue
            .iter()
            .filter_map(|p| p.not_before)
            .filter(|at| *at > now)
            .map(|at| at - now)
            .min()
            .map_or(tick, |d| d.min(tick))
    }

    /// Start as many queued tasks as capacity and headroom allow.
    async fn admit(&mut self) -> Result<(), SupervisorError> {
        if self.queue.is_empty() {
            return Ok(());
        }

        let snapshot = self
            .sup
            .monitor
            .sample()
            .with_active_workers(self.sup.gauge.active());
        let throttled = should_throttle(&snapshot, &self.sup.config.throttle);
        if throttled != self.throttled {
            self.throttled = throttled;
            if throttled {
                warn!(
                    batch_id = %self.batch_id,
                    cpu = snapshot.cpu_percent,
                    mem = snapshot.mem_percent,
                    active_workers = snapshot.active_worker_count,
                    "System over threshold, pausing admission"
                );
            } else {
                info!(batch_id = %self.batch_id, "System load recovered, resuming admission");
            }
        }
        if throttled {
            return Ok(());
        }

        loop {
            let now = Instant::now();
            let Some(index) = self.queue.iter().position(|p| p.is_eligible(now, &snapshot)) else {
                break;
            };
            let Some(slot) = Slot::reserve(&self.sup.gauge) else {
                break;
            };
            let Some(pending) = self.queue.remove(index) else {
                break;
            };
            self.start_attempt(pending.task_id, slot).await?;
        }
        Ok(())
    }

    async fn start_attempt(&mut self, task_id: TaskId, slot: Slot) -> Result<(), SupervisorError> {
        let sup = self.sup;
        let Some(entry) = self.entries.get_mut(&task_id) else {
            error!(task_id = %task_id, "Admitted task has no entry");
            return Ok(());
        };
        entry.attempts += 1;
        let attempt = entry.attempts;
        entry.first_started.get_or_insert_with(Instant::now);

        if entry.lease.is_none() {
            match WorkspaceLease::acquire(sup.provisioner.clone(), &task_id).await {
                Ok(lease) => entry.lease = Some(lease),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Workspace acquisition failed");
                    drop(slot);
                    let diagnostic = format!("workspace acquisition failed: {e}");
                    return self
                        .fail_attempt(task_id, attempt, FailureCategory::Permanent, diagnostic, TaskState::Failed)
                        .await;
                }
            }
        }
        let Some(lease) = entry.lease.as_ref() else {
            return Ok(());
        };

        match WorkerProcess::spawn(&entry.task, attempt, lease.handle(), &sup.command, sup.spawn_options()) {
            Ok(worker) => {
                let pid = worker.pid();
                self.active.insert(
                    task_id.clone(),
                    ActiveWorker {
                        attempt,
                        signal: worker.signal_handle(),
                        heartbeat: worker.heartbeat(),
                        timed_out: false,
                        _slot: slot,
                    },
                );
                self.drivers.spawn(drive(worker, self.tx.clone()));

                sup.registry.write().await.board.mark_running(&task_id, attempt, pid);
                sup.publish(SupervisorEvent::TaskStarted {
                    batch_id: self.batch_id.clone(),
                    task_id,
                    attempt,
                    pid,
                });
                Ok(())
            }
            Err(e) => {
                drop(slot);
                let diagnostic = e.to_string();
                let category = sup.classifier.classify(None, &diagnostic);
                warn!(task_id = %task_id, attempt, error = %e, %category, "Worker spawn failed");
                self.fail_attempt(task_id, attempt, category, diagnostic, TaskState::Failed)
                    .await
            }
        }
    }

    async fn handle(&mut self, message: WorkerMessage) -> Result<(), SupervisorError> {
        match message {
            WorkerMessage::Event(event) => {
                self.on_event(event).await;
                Ok(())
            }
            WorkerMessage::Exited {
                task_id,
                attempt,
                result,
            } => self.on_exit(task_id, attempt, result).await,
        }
    }

    async fn on_event(&mut self, event: ProgressEvent) {
        let current = self
            .active
            .get(&event.task_id)
            .is_some_and(|w| w.attempt == event.attempt);
        if !current {
            debug!(task_id = %event.task_id, attempt = event.attempt, "Dropping event from finished attempt");
            return;
        }

        if let Some(error) = &event.error {
            debug!(task_id = %event.task_id, phase = %event.phase, error = %error, "Worker reported error");
        }
        if let Some(artifact) = &event.artifact {
            if let Some(entry) = self.entries.get_mut(&event.task_id) {
                entry.artifact = Some(artifact.clone());
            }
        }
        self.sup.registry.write().await.board.apply_event(&event);
        self.sup.publish(SupervisorEvent::Progress(event));
    }

    async fn on_exit(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        result: Result<WorkerExit, WorkerError>,
    ) -> Result<(), SupervisorError> {
        let current = self
            .active
            .get(&task_id)
            .is_some_and(|w| w.attempt == attempt);
        if !current {
            error!(task_id = %task_id, attempt, "Exit for an attempt that is not active");
            return Ok(());
        }
        // Dropping the worker entry frees its gauge slot.
        self.active.remove(&task_id);

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                let diagnostic = e.to_string();
                let category = self.sup.classifier.classify(None, &diagnostic);
                return self
                    .fail_attempt(task_id, attempt, category, diagnostic, TaskState::Failed)
                    .await;
            }
        };

        let state = exit.state;
        match state {
            WorkerState::Succeeded => self.finish(task_id, TaskState::Succeeded).await,
            _ if self.cancelling => self.finish(task_id, TaskState::Cancelled).await,
            WorkerState::Cancelled => self.finish(task_id, TaskState::Cancelled).await,
            WorkerState::TimedOut => {
                let timeout = self.sup.config.heartbeat_timeout;
                let mut diagnostic = format!("no activity for {}ms", timeout.as_millis());
                if !exit.diagnostics.is_empty() {
                    diagnostic.push('\n');
                    diagnostic.push_str(&exit.diagnostics);
                }
                self.fail_attempt(task_id, attempt, FailureCategory::Transient, diagnostic, TaskState::TimedOut)
                    .await
            }
            _ => {
                // Supervisor-initiated kills end as Cancelled or TimedOut above,
                // so a signal here came from elsewhere, e.g. the OOM killer.
                let category = self.sup.classifier.classify(exit.status_code(), &exit.diagnostics);
                let diagnostic = if exit.diagnostics.is_empty() {
                    match (exit.exit_code, exit.signal) {
                        (Some(code), _) => format!("exit code {code}"),
                        (None, Some(signal)) => format!("terminated by signal {signal}"),
                        (None, None) => "terminated by signal".to_string(),
                    }
                } else {
                    exit.diagnostics
                };
                self.fail_attempt(task_id, attempt, category, diagnostic, TaskState::Failed)
                    .await
            }
        }
    }

    /// Record a failed attempt, then requeue or finish the task.
    ///
    /// `exhausted` is the final state used when no retry follows.
    async fn fail_attempt(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        category: FailureCategory,
        diagnostic: String,
        exhausted: TaskState,
    ) -> Result<(), SupervisorError> {
        let record = FailureRecord::new(task_id.clone(), attempt, category, diagnostic);
        let retry = !self.cancelling && self.sup.retry.should_retry(&record);

        let Some(entry) = self.entries.get_mut(&task_id) else {
            error!(task_id = %task_id, "Failure for a task that is already final");
            return Err(SupervisorError::DuplicateOutcome(task_id));
        };
        entry.history.push(record)?;

        if !retry {
            info!(task_id = %task_id, attempt, %category, "Attempt failed, not retrying");
            let state = if self.cancelling { TaskState::Cancelled } else { exhausted };
            return self.finish(task_id, state).await;
        }

        let delay = self.sup.retry.next_attempt_delay(attempt);
        warn!(
            task_id = %task_id,
            attempt,
            %category,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, retrying"
        );
        let now = Instant::now();
        self.queue.push_back(Pending {
            task_id: task_id.clone(),
            not_before: Some(now + delay),
            awaiting_headroom_since: (category == FailureCategory::Resource).then_some(now),
        });

        self.sup
            .registry
            .write()
            .await
            .board
            .mark_retry_pending(&task_id, category);
        self.sup.publish(SupervisorEvent::TaskRetrying {
            batch_id: self.batch_id.clone(),
            task_id,
            attempt,
            category,
            delay,
        });
        Ok(())
    }

    /// Write the task's outcome and release its workspace.
    async fn finish(&mut self, task_id: TaskId, state: TaskState) -> Result<(), SupervisorError> {
        let Some(mut entry) = self.entries.remove(&task_id) else {
            error!(task_id = %task_id, %state, "Task finished twice");
            return Err(SupervisorError::DuplicateOutcome(task_id));
        };

        if let Some(lease) = entry.lease.take() {
            if let Err(e) = lease.release().await {
                warn!(task_id = %task_id, error = %e, "Workspace release failed");
            }
        }

        let duration = entry
            .first_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let outcome = TaskOutcome::new(task_id, state, duration, entry.attempts)
            .with_artifact(entry.artifact)
            .with_failures(entry.history.into_records());

        info!(
            task_id = %outcome.task_id,
            state = %outcome.final_state,
            attempts = outcome.attempt_count,
            duration_ms = outcome.duration_ms,
            "Task finished"
        );

        self.sup.registry.write().await.board.mark_finished(&outcome);
        self.sup.publish(SupervisorEvent::TaskFinished {
            batch_id: self.batch_id.clone(),
            task_id: outcome.task_id.clone(),
            state: outcome.final_state,
            attempts: outcome.attempt_count,
        });
        self.aggregator.record(outcome)
    }

    /// Stop admission, cancel queued tasks and terminate running workers.
    async fn begin_cancel(&mut self) -> Result<(), SupervisorError> {
        self.cancelling = true;
        info!(
            batch_id = %self.batch_id,
            queued = self.queue.len(),
            running = self.active.len(),
            "Cancelling batch"
        );

        while let Some(pending) = self.queue.pop_front() {
            self.finish(pending.task_id, TaskState::Cancelled).await?;
        }
        for worker in self.active.values() {
            worker.signal.signal(SignalKind::Terminate);
        }
        Ok(())
    }

    /// Kill workers that have been silent for longer than the heartbeat timeout.
    fn check_heartbeats(&mut self) {
        let timeout = self.sup.config.heartbeat_timeout;
        for (task_id, worker) in self.active.iter_mut() {
            if worker.timed_out {
                continue;
            }
            let idle = worker.heartbeat.idle_for();
            if idle >= timeout {
                warn!(
                    task_id = %task_id,
                    attempt = worker.attempt,
                    idle_ms = idle.as_millis() as u64,
                    "Worker stopped reporting, killing"
                );
                worker.signal.timed_out();
                worker.timed_out = true;
            }
        }
    }

    fn reap_drivers(&mut self) {
        while let Some(result) = self.drivers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(batch_id = %self.batch_id, error = %e, "Worker driver panicked");
                }
            }
        }
    }
}

/// Forward a worker's events, then its exit, to the control loop.
async fn drive(mut worker: WorkerProcess, tx: mpsc::UnboundedSender<WorkerMessage>) {
    let task_id = worker.task_id().clone();
    let attempt = worker.attempt();
    let events = worker.events();

    let event_tx = tx.clone();
    let forward = async move {
        let Some(mut events) = events else {
            return;
        };
        while let Some(event) = events.next().await {
            if event_tx.send(WorkerMessage::Event(event)).is_err() {
                break;
            }
        }
    };

    let (result, ()) = tokio::join!(worker.wait(), forward);
    if tx
        .send(WorkerMessage::Exited {
            task_id,
            attempt,
            result,
        })
        .is_err()
    {
        debug!(attempt, "Control loop gone before worker exit was delivered");
    }
}
