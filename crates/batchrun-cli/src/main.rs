//! BatchRun CLI - run a batch of tasks through a worker program.

mod json_output;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use batchrun_core::{AggregateReport, Task, TaskSpec, TaskState};
use batchrun_supervisor::{
    metrics, BatchHandle, DirectoryProvisioner, Supervisor, SupervisorConfig, WorkerCommand,
};

/// BatchRun CLI - parallel task supervisor
#[derive(Parser)]
#[command(name = "batchrun")]
#[command(about = "Run a batch of tasks through a worker program", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of tasks
    Run(RunArgs),

    /// Check a tasks file and config without running anything
    Validate {
        /// Tasks file (JSON array of {id, payload, hints})
        #[arg(short, long)]
        tasks: PathBuf,

        /// Supervisor config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Tasks file (JSON array of {id, payload, hints})
    #[arg(short, long)]
    tasks: PathBuf,

    /// Supervisor config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum concurrent workers (overrides config)
    #[arg(short = 'j', long)]
    max_concurrency: Option<usize>,

    /// Attempts per task, including the first (overrides config)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Directory under which task workspaces are created
    #[arg(long, default_value_os_t = default_workspace_root())]
    workspace_root: PathBuf,

    /// Write the JSON report to this file
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Rewrite this file with Prometheus metrics on every status poll
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Status poll interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    status_interval_ms: u64,

    /// Stream events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Worker program and its arguments; may use {task_id}, {attempt}, {workspace}, {payload}
    #[arg(last = true, required = true)]
    worker: Vec<String>,
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("batchrun-workspaces")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("batchrun=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let all_succeeded = run_batch(args).await?;
            if !all_succeeded {
                std::process::exit(1);
            }
        }
        Commands::Validate { tasks, config } => {
            validate(&tasks, config.as_deref())?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SupervisorConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    };
    Ok(config)
}

fn load_tasks(path: &Path) -> Result<Vec<Task>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read tasks file '{}': {e}", path.display()))?;
    Ok(TaskSpec::parse_list(&text)?)
}

fn validate(tasks_path: &Path, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let tasks = load_tasks(tasks_path)?;

    let mut seen = std::collections::HashSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(format!("Duplicate task id: {}", task.id).into());
        }
    }
    if tasks.is_empty() {
        return Err("Tasks file contains no tasks".into());
    }

    println!("OK: {} task(s)", tasks.len());
    println!("  Concurrency:  {}", config.effective_concurrency());
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!("  Heartbeat:    {}ms", config.heartbeat_timeout.as_millis());
    Ok(())
}

async fn run_batch(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    if args.json {
        json_output::enable_json_mode();
    }

    let mut config = load_config(args.config.as_deref())?;
    if let Some(n) = args.max_concurrency {
        config.max_concurrency = Some(n);
    }
    if let Some(n) = args.max_attempts {
        config.retry.max_attempts = n;
    }

    let (program, worker_args) = args
        .worker
        .split_first()
        .ok_or("A worker command is required after --")?;
    let command = WorkerCommand::new(program.clone()).args(worker_args.iter().cloned());

    let tasks = load_tasks(&args.tasks)?;
    let supervisor = Arc::new(
        Supervisor::builder(config, command)
            .with_provisioner(Arc::new(DirectoryProvisioner::new(&args.workspace_root)))
            .build()?,
    );

    let batch = supervisor.submit(tasks).await?;
    json_output::emit_batch_started(
        batch.id().as_str(),
        batch.task_count(),
        supervisor.concurrency_limit(),
    );

    let forwarder = args.json.then(|| spawn_event_forwarder(&supervisor));
    let poller = spawn_status_poller(
        supervisor.clone(),
        Duration::from_millis(args.status_interval_ms.max(100)),
        args.metrics_file.clone(),
    );
    let interrupt = spawn_interrupt_handler(supervisor.clone(), batch.clone());

    let result = supervisor.run(&batch).await;

    poller.abort();
    interrupt.abort();
    if let Some((stop, forwarder)) = forwarder {
        // The forwarder flushes what is already queued before exiting.
        let _ = stop.send(());
        let _ = forwarder.await;
    }

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            json_output::emit_error(&e.to_string());
            return Err(e.into());
        }
    };

    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json_pretty()?)
            .map_err(|e| format!("Failed to write report '{}': {e}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }
    if let Some(path) = &args.metrics_file {
        write_metrics(&supervisor, path).await;
    }

    if json_output::is_json_mode() {
        json_output::emit_batch_finished(&report);
    } else {
        print_report(&report);
    }

    Ok(report.all_succeeded())
}

/// Forward supervisor notifications as JSON lines until told to stop.
fn spawn_event_forwarder(
    supervisor: &Arc<Supervisor>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let mut events = supervisor.subscribe();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => json_output::emit_supervisor_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event output fell behind, some events were dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut stop_rx => {
                    while let Ok(event) = events.try_recv() {
                        json_output::emit_supervisor_event(&event);
                    }
                    break;
                }
            }
        }
    });
    (stop_tx, handle)
}

/// Periodically report live status.
fn spawn_status_poller(
    supervisor: Arc<Supervisor>,
    every: Duration,
    metrics_file: Option<PathBuf>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let status = supervisor.status().await;
            if json_output::is_json_mode() {
                json_output::emit_status(&status);
            } else {
                info!(
                    running = status.count(TaskState::Running),
                    queued = status.count(TaskState::Queued),
                    retry_pending = status.count(TaskState::RetryPending),
                    succeeded = status.count(TaskState::Succeeded),
                    failed = status.count(TaskState::Failed) + status.count(TaskState::TimedOut),
                    cancelled = status.count(TaskState::Cancelled),
                    "Batch progress"
                );
            }
            if let Some(path) = &metrics_file {
                write_metrics(&supervisor, path).await;
            }
        }
    })
}

async fn write_metrics(supervisor: &Supervisor, path: &Path) {
    let text = metrics::render(&supervisor.status().await);
    if let Err(e) = tokio::fs::write(path, text).await {
        warn!(path = %path.display(), error = %e, "Failed to write metrics file");
    }
}

/// Cancel the batch on Ctrl-C.
fn spawn_interrupt_handler(
    supervisor: Arc<Supervisor>,
    batch: BatchHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, cancelling batch");
        if let Err(e) = supervisor.cancel(&batch).await {
            warn!(error = %e, "Cancel failed");
        }
    })
}

fn print_report(report: &AggregateReport) {
    println!("Batch {}:", report.batch_id);
    println!(
        "{:<32}  {:<12}  {:>8}  {:>10}  {}",
        "TASK", "STATE", "ATTEMPTS", "DURATION", "DETAIL"
    );
    println!("{}", "-".repeat(90));

    for outcome in report.outcomes.values() {
        let detail = match (&outcome.category, &outcome.output_artifact) {
            (_, Some(artifact)) if outcome.final_state == TaskState::Succeeded => artifact.clone(),
            (Some(category), _) => format!("{category}: {}", last_line(outcome.diagnostic.as_deref())),
            _ => String::new(),
        };
        println!(
            "{:<32}  {:<12}  {:>8}  {:>10}  {}",
            outcome.task_id.as_str(),
            outcome.final_state.as_str(),
            outcome.attempt_count,
            format_duration(outcome.duration_ms),
            detail
        );
    }

    let s = &report.summary;
    println!();
    println!(
        "Total: {}  Succeeded: {} ({} after retry)  Failed: {} ({} timed out)  Cancelled: {}",
        s.total, s.succeeded, s.succeeded_after_retry, s.failed, s.timed_out, s.cancelled
    );
    println!(
        "Wall time: {}  Attempts: {}  Peak concurrency: {}",
        format_duration(s.total_duration_ms),
        s.total_attempts,
        s.concurrency_achieved
    );
}

fn last_line(text: Option<&str>) -> &str {
    text.and_then(|t| t.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("")
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
