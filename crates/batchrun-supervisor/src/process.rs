//! Worker process supervision.
//!
//! A [`WorkerProcess`] runs the worker program for one attempt of one task.
//! Two background readers consume its stdout and stderr: stdout lines that
//! parse as progress records become [`ProgressEvent`]s, everything else is
//! kept in a bounded diagnostic tail used for failure classification.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use batchrun_core::{ProgressEvent, ProgressLine, Task, TaskId, WorkerState};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};

use crate::workspace::WorkspaceHandle;

/// How long to wait for output readers after the process exited.
const READER_DRAIN: Duration = Duration::from_millis(500);

/// Longest output line kept; the rest of an overlong line is discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Environment variables handed to every worker.
pub const ENV_TASK_ID: &str = "BATCHRUN_TASK_ID";
pub const ENV_ATTEMPT: &str = "BATCHRUN_ATTEMPT";
pub const ENV_WORKSPACE: &str = "BATCHRUN_WORKSPACE";
pub const ENV_PAYLOAD: &str = "BATCHRUN_PAYLOAD";

/// Errors that can occur while running a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} handle was not piped")]
    MissingPipe(&'static str),

    #[error("Failed waiting for worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// Stream of progress events for one attempt.
pub type EventStream = UnboundedReceiverStream<ProgressEvent>;

/// Program and arguments used to start workers.
///
/// Arguments may contain the placeholders `{task_id}`, `{attempt}`,
/// `{workspace}` and `{payload}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Add one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Substitute placeholders in the configured arguments.
    fn render_args(&self, task: &Task, attempt: u32, workspace: &Path) -> Vec<String> {
        let workspace = workspace.display().to_string();
        let payload = task.payload_json();
        let attempt = attempt.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{task_id}", task.id.as_str())
                    .replace("{attempt}", &attempt)
                    .replace("{workspace}", &workspace)
                    .replace("{payload}", &payload)
            })
            .collect()
    }
}

/// Per-spawn settings.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    /// Delay between a terminate signal and the forced kill.
    pub grace: Duration,
    /// Number of diagnostic lines to keep.
    pub tail_lines: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            tail_lines: 50,
        }
    }
}

/// Kind of stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalKind {
    /// Ask the worker to stop (SIGTERM to its process group).
    Terminate,
    /// Kill the worker immediately (SIGKILL to its process group).
    Kill,
}

/// Why a worker was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StopRequest {
    kind: SignalKind,
    reason: StopReason,
}

/// Monotonic record of the last time a worker produced any output.
#[derive(Debug)]
pub struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Heartbeat {
    fn new(origin: Instant) -> Self {
        Self {
            origin,
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Instant of the last observed activity (spawn time if none yet).
    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    /// Time since the last observed activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

/// Bounded tail of diagnostic lines.
#[derive(Debug)]
struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

type SharedTail = Arc<Mutex<DiagnosticTail>>;

fn push_diagnostic(tail: &SharedTail, line: String) {
    // A poisoned tail only means a reader panicked mid-push; keep going.
    let mut guard = tail.lock().unwrap_or_else(|e| e.into_inner());
    guard.push(line);
}

/// Cloneable handle used to stop a worker from another task.
#[derive(Debug, Clone)]
pub struct WorkerSignal {
    pid: Option<u32>,
    tx: Arc<watch::Sender<Option<StopRequest>>>,
}

impl WorkerSignal {
    /// Request the worker to stop. Repeated or weaker requests are no-ops.
    pub fn signal(&self, kind: SignalKind) {
        self.send(kind, StopReason::Cancelled);
    }

    /// Kill the worker because it stopped reporting progress.
    pub fn timed_out(&self) {
        self.send(SignalKind::Kill, StopReason::TimedOut);
    }

    fn send(&self, kind: SignalKind, reason: StopReason) {
        let escalated = self.tx.send_if_modified(|current| {
            if let Some(existing) = current {
                if existing.kind >= kind {
                    return false;
                }
                existing.kind = kind;
                return true;
            }
            *current = Some(StopRequest { kind, reason });
            true
        });
        if escalated {
            deliver_signal(self.pid, kind);
        }
    }
}

/// Result of a finished worker attempt.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    pub duration: Duration,
    pub state: WorkerState,
    /// Tail of stderr, unstructured stdout and reported errors.
    pub diagnostics: String,
}

impl WorkerExit {
    pub fn succeeded(&self) -> bool {
        self.state == WorkerState::Succeeded
    }

    /// Exit status in shell convention: a signal death reads as 128 + signal.
    pub fn status_code(&self) -> Option<i32> {
        self.exit_code.or_else(|| self.signal.map(|signal| 128 + signal))
    }
}

/// One running attempt of a worker program.
pub struct WorkerProcess {
    task_id: TaskId,
    attempt: u32,
    pid: Option<u32>,
    workspace: PathBuf,
    started_at: Instant,
    state: WorkerState,
    grace: Duration,
    child: Child,
    events: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    readers: Vec<JoinHandle<()>>,
    diagnostics: SharedTail,
    heartbeat: Arc<Heartbeat>,
    signal: WorkerSignal,
    signal_rx: watch::Receiver<Option<StopRequest>>,
}

impl WorkerProcess {
    /// Start the worker program for one attempt of `task` inside `workspace`.
    pub fn spawn(
        task: &Task,
        attempt: u32,
        workspace: &WorkspaceHandle,
        command: &WorkerCommand,
        options: SpawnOptions,
    ) -> Result<Self, WorkerError> {
        let mut cmd = Command::new(command.program());
        cmd.args(command.render_args(task, attempt, workspace.path()))
            .env(ENV_TASK_ID, task.id.as_str())
            .env(ENV_ATTEMPT, attempt.to_string())
            .env(ENV_WORKSPACE, workspace.path())
            .env(ENV_PAYLOAD, task.payload_json())
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so signals reach the worker's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(task_id = %task.id, attempt, command = ?cmd, "Spawning worker");

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            program: command.program().to_string(),
            source,
        })?;
        let started_at = Instant::now();
        let pid = child.id();

        let stdout = child.stdout.take().ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(WorkerError::MissingPipe("stderr"))?;

        let diagnostics: SharedTail = Arc::new(Mutex::new(DiagnosticTail::new(options.tail_lines)));
        let heartbeat = Arc::new(Heartbeat::new(started_at));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let readers = vec![
            tokio::spawn(read_stdout(
                stdout,
                task.id.clone(),
                attempt,
                events_tx,
                diagnostics.clone(),
                heartbeat.clone(),
            )),
            tokio::spawn(read_stderr(
                stderr,
                task.id.clone(),
                diagnostics.clone(),
                heartbeat.clone(),
            )),
        ];

        let (signal_tx, signal_rx) = watch::channel(None);

        info!(task_id = %task.id, attempt, pid = ?pid, "Worker spawned");

        Ok(Self {
            task_id: task.id.clone(),
            attempt,
            pid,
            workspace: workspace.path().to_path_buf(),
            started_at,
            state: WorkerState::Spawned,
            grace: options.grace,
            child,
            events: Some(events_rx),
            readers,
            diagnostics,
            heartbeat,
            signal: WorkerSignal {
                pid,
                tx: Arc::new(signal_tx),
            },
            signal_rx,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Workspace directory the worker runs in. The worker does not own it.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Shared activity clock, updated on every output line.
    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    /// Handle for stopping the worker from elsewhere.
    pub fn signal_handle(&self) -> WorkerSignal {
        self.signal.clone()
    }

    /// Request the worker to stop. Idempotent.
    pub fn signal(&self, kind: SignalKind) {
        self.signal.signal(kind);
    }

    /// Take the progress event stream.
    ///
    /// The stream is ordered by emission and ends once the worker's stdout
    /// closes. It can be taken once; later calls return `None`.
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take().map(UnboundedReceiverStream::new)
    }

    /// Wait for the worker to exit.
    ///
    /// While waiting, a terminate request escalates to a kill after the
    /// grace period.
    pub async fn wait(&mut self) -> Result<WorkerExit, WorkerError> {
        if self.state == WorkerState::Spawned {
            self.advance(WorkerState::Running);
        }

        let mut applied: Option<SignalKind> = None;
        let mut kill_at: Option<tokio::time::Instant> = None;

        let status = loop {
            let requested = *self.signal_rx.borrow_and_update();
            if let Some(request) = requested {
                if applied.map_or(true, |kind| kind < request.kind) {
                    match request.kind {
                        SignalKind::Terminate => {
                            kill_at = Some(tokio::time::Instant::now() + self.grace);
                        }
                        SignalKind::Kill => {
                            kill_at = None;
                            if let Err(e) = self.child.start_kill() {
                                trace!(error = %e, "start_kill after exit");
                            }
                        }
                    }
                    applied = Some(request.kind);
                }
            }

            let deadline = kill_at;
            let step = tokio::select! {
                status = self.child.wait() => WaitStep::Exited(status),
                _ = self.signal_rx.changed() => WaitStep::Signalled,
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => WaitStep::GraceElapsed,
            };

            match step {
                WaitStep::Exited(status) => break status.map_err(WorkerError::Wait)?,
                WaitStep::Signalled => {}
                WaitStep::GraceElapsed => {
                    warn!(task_id = %self.task_id, pid = ?self.pid, "Grace period elapsed, killing worker");
                    self.signal.signal(SignalKind::Kill);
                }
            }
        };

        self.drain_readers().await;

        let duration = self.started_at.elapsed();
        let stop = *self.signal_rx.borrow();
        self.advance(final_state(&status, stop.map(|s| s.reason)));

        let diagnostics = self
            .diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .render();

        info!(
            task_id = %self.task_id,
            attempt = self.attempt,
            exit_code = ?status.code(),
            signal = ?exit_signal(&status),
            state = ?self.state,
            duration_ms = duration.as_millis() as u64,
            "Worker exited"
        );

        Ok(WorkerExit {
            exit_code: status.code(),
            signal: exit_signal(&status),
            duration,
            state: self.state,
            diagnostics,
        })
    }

    fn advance(&mut self, next: WorkerState) {
        if let Err(e) = self.state.transition(next) {
            debug!(task_id = %self.task_id, error = %e, "Ignoring worker state change");
        }
    }

    /// Give readers a moment to flush, then cut them off so the event stream ends.
    async fn drain_readers(&mut self) {
        let deadline = tokio::time::Instant::now() + READER_DRAIN;
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                debug!(task_id = %self.task_id, "Output reader still open after exit, aborting");
                abort.abort();
            }
        }
    }
}

enum WaitStep {
    Exited(std::io::Result<ExitStatus>),
    Signalled,
    GraceElapsed,
}

fn final_state(status: &ExitStatus, stop: Option<StopReason>) -> WorkerState {
    if status.success() {
        return WorkerState::Succeeded;
    }
    match stop {
        Some(StopReason::TimedOut) => WorkerState::TimedOut,
        Some(StopReason::Cancelled) => WorkerState::Cancelled,
        None => WorkerState::Failed,
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn deliver_signal(pid: Option<u32>, kind: SignalKind) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = match kind {
        SignalKind::Terminate => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
    };
    // ESRCH just means the group already exited.
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        trace!(pid = raw, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn deliver_signal(_pid: Option<u32>, _kind: SignalKind) {
    // Without process groups the wait loop's start_kill does the work.
}

/// Outcome of reading one output line.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Eof,
    Complete,
    /// The line exceeded the limit; `buf` holds its first `limit` bytes.
    Truncated,
}

/// Read one line into `buf`, keeping at most `limit` bytes of it.
///
/// The remainder of an overlong line is consumed and dropped so the next
/// call starts at the following line.
async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<LineRead> {
    let read = (&mut *reader).take(limit as u64).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if read < limit || buf.last() == Some(&b'\n') {
        return Ok(LineRead::Complete);
    }

    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            break;
        }
    }
    Ok(LineRead::Truncated)
}

fn truncated_text(buf: &[u8]) -> String {
    format!("{} [truncated]", String::from_utf8_lossy(buf).trim_end())
}

/// Read worker stdout, turning progress records into events.
async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    task_id: TaskId,
    attempt: u32,
    events_tx: mpsc::UnboundedSender<ProgressEvent>,
    diagnostics: SharedTail,
    heartbeat: Arc<Heartbeat>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut seq = 0u64;

    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::Truncated) => {
                heartbeat.touch();
                warn!(task_id = %task_id, limit = MAX_LINE_BYTES, "Truncated overlong stdout line");
                push_diagnostic(&diagnostics, truncated_text(&buf));
            }
            Ok(LineRead::Complete) => {
                heartbeat.touch();
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match ProgressLine::parse(&line) {
                    ProgressLine::Record(record) => {
                        if let Some(error) = &record.error {
                            push_diagnostic(&diagnostics, format!("[{}] {}", record.phase, error));
                        }
                        let event = ProgressEvent::from_record(task_id.clone(), attempt, seq, record);
                        seq += 1;
                        trace!(task_id = %task_id, phase = %event.phase, seq = event.seq, "Progress event");
                        // The consumer may have gone away; keep draining output.
                        let _ = events_tx.send(event);
                    }
                    ProgressLine::Raw(text) => push_diagnostic(&diagnostics, text),
                    ProgressLine::Malformed { line, reason } => {
                        warn!(task_id = %task_id, reason = %reason, "Skipping malformed progress record");
                        push_diagnostic(&diagnostics, line);
                    }
                }
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Error reading worker stdout");
                break;
            }
        }
    }
    debug!(task_id = %task_id, events = seq, "Worker stdout closed");
}

/// Read worker stderr into the diagnostic tail.
async fn read_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    task_id: TaskId,
    diagnostics: SharedTail,
    heartbeat: Arc<Heartbeat>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(LineRead::Eof) => break,
            Ok(LineRead::Truncated) => {
                heartbeat.touch();
                push_diagnostic(&diagnostics, truncated_text(&buf));
            }
            Ok(LineRead::Complete) => {
                heartbeat.touch();
                let line = String::from_utf8_lossy(&buf);
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    trace!(task_id = %task_id, stderr = %trimmed, "Worker stderr");
                    push_diagnostic(&diagnostics, trimmed.to_string());
                }
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}
