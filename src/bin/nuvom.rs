//! Nuvom CLI - command-line interface for the task queue and job execution engine.
//!
//! Because there's no separate server process here, this binary links
//! `nuvom_core` directly rather than talking to one over HTTP (`spec.md`
//! §6.1 — the teacher's `apex-cli` talks to a running `apex-server`; that
//! split has no counterpart in a single-process engine).

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use nuvom_core::codec::Value;
use nuvom_core::config::Config;
use nuvom_core::discovery::{ManifestManager, TaskReference};
use nuvom_core::job::{Job, JobStatus};
use nuvom_core::orchestrator::{WorkerPool, WorkerPoolConfig};
use nuvom_core::registry::capability::{CapabilityRegistry, CAP_QUEUE_BACKEND, CAP_RESULT_BACKEND};
use nuvom_core::registry::manifest::{PluginLoader, PluginManifest};
use nuvom_core::result::ResultBackend;
use nuvom_core::runner::JobRunner;
use nuvom_core::task::{RegisterMode, Task, TaskRegistry};
use nuvom_core::{ErrorCode, NuvomError};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI Structure
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[command(
    name = "nuvom",
    author = "Nuvom Contributors",
    version,
    about = "Nuvom - a single-host, pluggable-backend task queue",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version string
    Version,

    /// Print the effective configuration
    Config,

    /// Start the worker pool and scheduler
    Runworker {
        /// Watch the discovery manifest for changes and re-register tasks
        #[arg(long)]
        dev: bool,
    },

    /// Print the status of a job
    Status {
        /// Job id
        job_id: String,
    },

    /// Task discovery operations
    #[command(subcommand)]
    Discover(DiscoverCommands),

    /// Listing operations
    #[command(subcommand)]
    List(ListCommands),

    /// Inspect a single record
    #[command(subcommand)]
    Inspect(InspectCommands),

    /// Query recent job history
    #[command(subcommand)]
    History(HistoryCommands),

    /// Run a single job synchronously, in-process
    #[command(subcommand)]
    Runtestworker(RuntestworkerCommands),

    /// Capability registry / plugin operations
    #[command(subcommand)]
    Plugins(PluginsCommands),
}

#[derive(Subcommand)]
enum DiscoverCommands {
    /// Scan registered tasks and update the discovery manifest
    Tasks {
        /// Only include tasks whose name matches this glob
        #[arg(long)]
        include: Option<String>,

        /// Exclude tasks whose name matches this glob
        #[arg(long)]
        exclude: Option<String>,
    },
}

#[derive(Subcommand)]
enum ListCommands {
    /// Enumerate registered tasks with their static metadata
    Tasks,
}

#[derive(Subcommand)]
enum InspectCommands {
    /// Show the full result-backend record for a job
    Job {
        id: String,

        #[arg(long, default_value = "table")]
        format: InspectFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InspectFormat {
    Table,
    Json,
    Raw,
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// List the most recent job records
    Recent {
        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        status: Option<JobStatusFilter>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum JobStatusFilter {
    Success,
    Failed,
    Pending,
    Running,
}

#[derive(Subcommand)]
enum RuntestworkerCommands {
    /// Execute one job described by a JSON file, synchronously
    Run {
        /// Path to a JSON file: {func_name, args?, kwargs?, timeout_secs?, retries?}
        job_json: PathBuf,
    },
}

#[derive(Subcommand)]
enum PluginsCommands {
    /// Enumerate (capability, name, provider-type) providers currently registered
    Status,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tabled row shapes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Tabled, Serialize)]
struct TaskRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Retries")]
    retries: u32,
    #[tabled(rename = "Timeout (s)")]
    timeout_secs: u64,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Tags")]
    tags: String,
}

#[derive(Tabled, Serialize)]
struct HistoryRow {
    #[tabled(rename = "Job Id")]
    job_id: String,
    #[tabled(rename = "Task")]
    func_name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Completed At")]
    completed_at: String,
}

#[derive(Tabled, Serialize)]
struct PluginRow {
    #[tabled(rename = "Capability")]
    capability: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Provider Type")]
    provider_type: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Output Helpers
// ═══════════════════════════════════════════════════════════════════════════════

struct OutputHelper {
    format: OutputFormat,
}

impl OutputHelper {
    fn new(format: OutputFormat, no_color: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format }
    }

    fn print_success(&self, message: &str) {
        match self.format {
            OutputFormat::Json => println!(r#"{{"status": "success", "message": "{}"}}"#, message),
            _ => println!("{} {}", "[OK]".green().bold(), message),
        }
    }

    fn print_error(&self, message: &str) {
        match self.format {
            OutputFormat::Json => eprintln!(r#"{{"status": "error", "message": "{}"}}"#, message),
            _ => eprintln!("{} {}", "[ERROR]".red().bold(), message),
        }
    }

    fn print_table<T: Tabled + Serialize>(&self, items: &[T]) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(items)?,
            _ => {
                if items.is_empty() {
                    println!("{}", "No results found.".dimmed());
                    return Ok(());
                }
                let table = Table::new(items)
                    .with(Style::rounded())
                    .with(Modify::new(Columns::first()).with(Alignment::left()))
                    .to_string();
                println!("{}", table);
            }
        }
        Ok(())
    }

    fn print_json<T: Serialize>(&self, data: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    fn print_header(&self, title: &str) {
        if self.format != OutputFormat::Json {
            println!();
            println!("{}", title.bold().underline());
            println!();
        }
    }
}

fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}").unwrap());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn format_status(status: JobStatus) -> String {
    match status {
        JobStatus::Success => "SUCCESS".green().bold().to_string(),
        JobStatus::Failed => "FAILED".red().bold().to_string(),
        JobStatus::Running => "RUNNING".blue().to_string(),
        JobStatus::Pending => "PENDING".yellow().to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in demo task catalog
// ═══════════════════════════════════════════════════════════════════════════════

/// Nuvom tasks are ordinarily registered by the embedding application's own
/// code (`spec.md` §3: "registered at process start"). This binary has no
/// embedding application, so it seeds a handful of demo tasks itself —
/// enough for `runworker`/`runtestworker`/`list tasks`/`discover tasks` to
/// have something real to operate on.
fn value_as_i64(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Int(n)) => *n,
        _ => 0,
    }
}

fn builtin_tasks() -> Vec<Task> {
    vec![
        Task::new("echo", Arc::new(|args, _kwargs, _ctx| Ok(args.first().cloned().unwrap_or(Value::Null))))
            .with_description("returns its first argument unchanged")
            .with_category("demo"),
        Task::new(
            "add",
            Arc::new(|args, _kwargs, _ctx| {
                let a = value_as_i64(args.first());
                let b = value_as_i64(args.get(1));
                Ok(Value::Int(a + b))
            }),
        )
        .with_description("sums its first two arguments")
        .with_category("demo"),
        Task::new("sleep", Arc::new(|_args, _kwargs, _ctx| Ok(Value::Null)))
            .with_timeout_secs(5)
            .with_description("no-op placeholder for timeout scenarios")
            .with_category("demo"),
    ]
}

async fn registry_with_builtins() -> Result<TaskRegistry> {
    let registry = TaskRegistry::new();
    for task in builtin_tasks() {
        registry.register(task, RegisterMode::Silent).await?;
    }
    Ok(registry)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Handlers
// ═══════════════════════════════════════════════════════════════════════════════

async fn handle_version(output: &OutputHelper) -> Result<()> {
    output.print_success(&format!("nuvom {}", env!("CARGO_PKG_VERSION")));
    Ok(())
}

async fn handle_config(config: &Config, output: &OutputHelper) -> Result<()> {
    output.print_header("Effective configuration");
    output.print_json(&serde_json::json!({
        "environment": config.environment.to_string(),
        "queue_backend": config.queue_backend,
        "result_backend": config.result_backend,
        "serialization_backend": config.serialization_backend,
        "queue_maxsize": config.queue_maxsize,
        "max_workers": config.max_workers,
        "batch_size": config.batch_size,
        "job_timeout_secs": config.job_timeout_secs,
        "retry_delay_secs": config.retry_delay_secs,
        "sqlite_db_path": config.sqlite_db_path,
        "prometheus_port": config.prometheus_port,
        "queue_dir": config.queue_dir,
        "result_dir": config.result_dir,
    }))?;
    Ok(())
}

async fn handle_runworker(dev: bool, config: &Config, output: &OutputHelper) -> Result<()> {
    let capabilities = CapabilityRegistry::new();
    capabilities.ensure_builtins(config).await?;

    let loader = PluginLoader::new();
    let manifest = PluginManifest::load(".nuvom_plugins.toml").await?;
    loader.load(&manifest, &capabilities, config).await?;

    let queue = capabilities.get_queue_backend(Some(config.queue_backend.as_str())).await?;
    let results = capabilities.get_result_backend(Some(config.result_backend.as_str())).await?;
    let tasks = registry_with_builtins().await?;

    if dev {
        output.print_success("dev mode: watching discovery manifest for changes (best-effort)");
    }

    let runner = Arc::new(JobRunner::new(tasks, queue.clone(), results, 0, config.job_timeout_secs));
    let pool = WorkerPool::start(runner, queue, WorkerPoolConfig::new(config.max_workers, config.batch_size))
        .with_plugins(loader.started_plugins().await);

    let spinner = create_spinner("worker pool running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    spinner.finish_and_clear();

    output.print_success("shutting down, draining in-flight jobs");
    pool.shutdown().await;
    Ok(())
}

async fn handle_status(job_id: &str, config: &Config, output: &OutputHelper) -> Result<()> {
    let capabilities = CapabilityRegistry::new();
    capabilities.ensure_builtins(config).await?;
    let results = capabilities.get_result_backend(Some(config.result_backend.as_str())).await?;

    match results.get_full(job_id).await? {
        None => output.print_success("PENDING"),
        Some(record) => match record.status {
            JobStatus::Success => {
                let value = record.result.map(|v| format!("{v:?}")).unwrap_or_default();
                output.print_success(&format!("SUCCESS {value}"));
            }
            JobStatus::Failed => {
                let message = record.error.map(|e| e.message).unwrap_or_default();
                output.print_error(&format!("FAILED {message}"));
            }
            JobStatus::Pending | JobStatus::Running => output.print_success("PENDING"),
        },
    }
    Ok(())
}

async fn handle_discover_tasks(include: Option<String>, exclude: Option<String>, output: &OutputHelper) -> Result<()> {
    let tasks = registry_with_builtins().await?;
    let include_pattern = include.map(|p| glob::Pattern::new(&p)).transpose()?;
    let exclude_pattern = exclude.map(|p| glob::Pattern::new(&p)).transpose()?;

    let mut refs = Vec::new();
    for task in tasks.all().await {
        if let Some(p) = &include_pattern {
            if !p.matches(&task.name) {
                continue;
            }
        }
        if let Some(p) = &exclude_pattern {
            if p.matches(&task.name) {
                continue;
            }
        }
        refs.push(TaskReference::new(format!("builtin::{}", task.name), task.name.clone(), Some(task.name.clone())));
    }

    let manager = ManifestManager::new(ManifestManager::default_path());
    let diff = manager.diff_and_save(refs, Vec::new()).await?;

    output.print_success(&format!(
        "discovered: {} added, {} removed, {} modified (saved={})",
        diff.tasks_added.len(),
        diff.tasks_removed.len(),
        diff.tasks_modified.len(),
        diff.saved
    ));
    Ok(())
}

async fn handle_list_tasks(output: &OutputHelper) -> Result<()> {
    let tasks = registry_with_builtins().await?;
    output.print_header("Registered tasks");
    let rows: Vec<TaskRow> = tasks
        .all()
        .await
        .into_iter()
        .map(|t| TaskRow {
            name: t.name.clone(),
            retries: t.default_retries,
            timeout_secs: t.default_timeout_secs.unwrap_or(0),
            category: t.metadata.category.clone().unwrap_or_default(),
            tags: t.metadata.tags.join(","),
        })
        .collect();
    output.print_table(&rows)
}

async fn handle_inspect_job(id: &str, format: InspectFormat, config: &Config, output: &OutputHelper) -> Result<()> {
    let capabilities = CapabilityRegistry::new();
    capabilities.ensure_builtins(config).await?;
    let results = capabilities.get_result_backend(Some(config.result_backend.as_str())).await?;

    let record = results
        .get_full(id)
        .await?
        .ok_or_else(|| NuvomError::not_found("job", Some(id)))?;

    match format {
        InspectFormat::Json | InspectFormat::Raw => output.print_json(&record)?,
        InspectFormat::Table => {
            output.print_header(&format!("Job {id}"));
            println!("  task:         {}", record.func_name);
            println!("  status:       {}", format_status(record.status));
            println!("  attempts:     {}", record.attempts.unwrap_or_default());
            println!("  retries left: {}", record.retries_left.unwrap_or_default());
            println!("  created_at:   {}", record.created_at);
            println!("  completed_at: {}", record.completed_at);
            if let Some(result) = &record.result {
                println!("  result:       {result:?}");
            }
            if let Some(error) = &record.error {
                println!("  error:        {} ({})", error.message, error.r#type);
            }
        }
    }
    Ok(())
}

async fn handle_history_recent(
    limit: usize,
    status: Option<JobStatusFilter>,
    config: &Config,
    output: &OutputHelper,
) -> Result<()> {
    let capabilities = CapabilityRegistry::new();
    capabilities.ensure_builtins(config).await?;
    let results = capabilities.get_result_backend(Some(config.result_backend.as_str())).await?;

    let want_status = status.map(|s| match s {
        JobStatusFilter::Success => JobStatus::Success,
        JobStatusFilter::Failed => JobStatus::Failed,
        JobStatusFilter::Pending => JobStatus::Pending,
        JobStatusFilter::Running => JobStatus::Running,
    });

    let mut records = results.list_jobs().await?;
    if let Some(want) = want_status {
        records.retain(|r| r.status == want);
    }
    records.truncate(limit);

    output.print_header("Recent job history");
    let rows: Vec<HistoryRow> = records
        .into_iter()
        .map(|r| HistoryRow {
            job_id: r.job_id,
            func_name: r.func_name,
            status: format_status(r.status),
            completed_at: r.completed_at.to_rfc3339(),
        })
        .collect();
    output.print_table(&rows)
}

#[derive(serde::Deserialize)]
struct JobSpec {
    func_name: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: BTreeMap<String, Value>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
}

async fn handle_runtestworker_run(job_json: &PathBuf, output: &OutputHelper) -> Result<()> {
    let text = tokio::fs::read_to_string(job_json).await?;
    let spec: JobSpec = serde_json::from_str(&text)?;

    let tasks = registry_with_builtins().await?;
    let queue = Arc::new(nuvom_core::queue::memory::MemoryQueue::new(0));
    let results = Arc::new(nuvom_core::result::memory::MemoryResultBackend::new());

    let mut job = Job::new(spec.func_name, spec.args, spec.kwargs);
    if let Some(timeout_secs) = spec.timeout_secs {
        job = job.with_timeout_secs(timeout_secs);
    }
    if let Some(retries) = spec.retries {
        job = job.with_retries(retries);
    }

    let runner = JobRunner::new(tasks, queue, results, 0, 30);
    match runner.run(job).await {
        nuvom_core::runner::RunOutcome::Success(job) => {
            output.print_success(&format!("SUCCESS {:?}", job.result));
            Ok(())
        }
        nuvom_core::runner::RunOutcome::Failed(job) => {
            let message = job.error.map(|e| e.message).unwrap_or_default();
            output.print_error(&format!("FAILED {message}"));
            Err(anyhow!("job failed"))
        }
        nuvom_core::runner::RunOutcome::Requeued(_) => {
            output.print_error("job requeued instead of completing synchronously");
            Err(anyhow!("job requeued"))
        }
    }
}

async fn handle_plugins_status(config: &Config, output: &OutputHelper) -> Result<()> {
    let capabilities = CapabilityRegistry::new();
    capabilities.ensure_builtins(config).await?;

    let loader = PluginLoader::new();
    let manifest = PluginManifest::load(".nuvom_plugins.toml").await?;
    loader.load(&manifest, &capabilities, config).await?;

    let mut rows = Vec::new();
    for name in ["memory", "file"] {
        if capabilities.get_queue_backend(Some(name)).await.is_ok() {
            let provider_type = if loader.is_loaded(CAP_QUEUE_BACKEND, name).await { "plugin" } else { "built-in" };
            rows.push(PluginRow {
                capability: CAP_QUEUE_BACKEND.to_string(),
                name: name.to_string(),
                provider_type: provider_type.to_string(),
            });
        }
    }
    for name in ["memory", "file", "sqlite"] {
        if capabilities.get_result_backend(Some(name)).await.is_ok() {
            let provider_type = if loader.is_loaded(CAP_RESULT_BACKEND, name).await { "plugin" } else { "built-in" };
            rows.push(PluginRow {
                capability: CAP_RESULT_BACKEND.to_string(),
                name: name.to_string(),
                provider_type: provider_type.to_string(),
            });
        }
    }
    for plugin in loader.started_plugins().await {
        for capability in plugin.provides() {
            if !rows.iter().any(|r| r.capability == *capability && r.name == plugin.name()) {
                rows.push(PluginRow {
                    capability: capability.to_string(),
                    name: plugin.name().to_string(),
                    provider_type: "plugin".to_string(),
                });
            }
        }
    }

    output.print_header("Registered capability providers");
    output.print_table(&rows)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Entry Point
// ═══════════════════════════════════════════════════════════════════════════════

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<NuvomError>() {
        Some(e) => match e.code {
            ErrorCode::BackendUnavailable
            | ErrorCode::Internal
            | ErrorCode::PluginLoadFailure
            | ErrorCode::DecodeCorruption
            | ErrorCode::HookFailure
            | ErrorCode::ProtocolViolation
            | ErrorCode::SpecImportFailed => 2,
            _ => 1,
        },
        None => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = OutputHelper::new(cli.format, cli.no_color);

    let config = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .unwrap_or_default();

    if cli.verbose {
        let _ = nuvom_core::telemetry::init_telemetry(&config.telemetry, &config.environment.to_string());
    }

    let result = match cli.command {
        Commands::Version => handle_version(&output).await,
        Commands::Config => handle_config(&config, &output).await,
        Commands::Runworker { dev } => handle_runworker(dev, &config, &output).await,
        Commands::Status { job_id } => handle_status(&job_id, &config, &output).await,
        Commands::Discover(DiscoverCommands::Tasks { include, exclude }) => {
            handle_discover_tasks(include, exclude, &output).await
        }
        Commands::List(ListCommands::Tasks) => handle_list_tasks(&output).await,
        Commands::Inspect(InspectCommands::Job { id, format }) => handle_inspect_job(&id, format, &config, &output).await,
        Commands::History(HistoryCommands::Recent { limit, status }) => {
            handle_history_recent(limit, status, &config, &output).await
        }
        Commands::Runtestworker(RuntestworkerCommands::Run { job_json }) => {
            handle_runtestworker_run(&job_json, &output).await
        }
        Commands::Plugins(PluginsCommands::Status) => handle_plugins_status(&config, &output).await,
    };

    if let Err(e) = result {
        output.print_error(&format!("{:#}", e));
        std::process::exit(exit_code_for(&e));
    }

    Ok(())
}
