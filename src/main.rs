use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use convoy::core::analyzer::DependencyAnalyzer;
use convoy::core::task::Task;
use convoy::orchestrator::{Orchestrator, OrchestratorEvent};
use convoy::{clog, Config, Result};

#[derive(Parser)]
#[command(name = "convoy", about = "Run coding agents in parallel over a task dependency graph", version)]
struct Cli {
    /// Enable debug logging to ~/.convoy/convoy.log
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a task list and print the wave plan without running anything
    Plan {
        /// Path to a JSON file containing the task list
        #[arg(long)]
        tasks: PathBuf,
        /// Override the configured parallelism ceiling
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Execute a task list against a repository
    Run {
        /// Path to a JSON file containing the task list
        #[arg(long)]
        tasks: PathBuf,
        /// Repository to run against
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Override the configured parallelism ceiling
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Leave completed task branches unmerged
        #[arg(long)]
        no_merge: bool,
        /// Print the plan and exit without executing
        #[arg(long)]
        dry_run: bool,
    },
}

fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

async fn plan(tasks_path: &Path, max_parallel: Option<usize>) -> Result<ExitCode> {
    let config = Config::load()?;
    let tasks = load_tasks(tasks_path)?;
    let plan =
        DependencyAnalyzer::analyze(&tasks, max_parallel.unwrap_or(config.max_parallel))?;

    println!("{}", serde_json::to_string_pretty(&plan)?);
    eprintln!(
        "{} tasks in {} waves, estimated parallelism {}",
        plan.total_tasks,
        plan.wave_count(),
        plan.estimated_parallelism
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(
    tasks_path: &Path,
    repo: &Path,
    max_parallel: Option<usize>,
    no_merge: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let mut config = Config::load()?;
    if let Some(n) = max_parallel {
        config.max_parallel = n;
    }
    config.ensure_dirs()?;

    let tasks = load_tasks(tasks_path)?;
    if dry_run {
        return plan(tasks_path, Some(config.max_parallel)).await;
    }
    let mut orchestrator = Orchestrator::new(config, repo)?;
    orchestrator.merge_completed = !no_merge;

    let (tx, mut rx) = mpsc::channel::<OrchestratorEvent>(1024);
    orchestrator.set_event_sender(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                OrchestratorEvent::WaveStarted { number, task_ids } => {
                    let ids: Vec<&str> = task_ids.iter().map(|t| t.as_str()).collect();
                    println!("wave {} started: {}", number, ids.join(", "));
                }
                OrchestratorEvent::SessionCreated { task_id } => {
                    println!("task {} workspace ready", task_id);
                }
                OrchestratorEvent::TaskStarted { task_id, .. } => {
                    println!("task {} started", task_id);
                }
                OrchestratorEvent::TaskOutput { task_id, line } => {
                    println!("[{}] {}", task_id, line);
                }
                OrchestratorEvent::TaskCompleted { task_id } => {
                    println!("task {} completed", task_id);
                }
                OrchestratorEvent::TaskFailed { task_id, error } => {
                    eprintln!("task {} failed: {}", task_id, error);
                }
                OrchestratorEvent::TaskCancelled { task_id } => {
                    eprintln!("task {} cancelled", task_id);
                }
                OrchestratorEvent::WaveFinished { number } => {
                    println!("wave {} finished", number);
                }
                OrchestratorEvent::ProgressUpdate {
                    finished,
                    total,
                    percent,
                } => {
                    println!("progress: {}/{} ({}%)", finished, total, percent);
                }
                OrchestratorEvent::ExecutionFinished { .. } => {}
                OrchestratorEvent::StopRequested => {
                    eprintln!("stopping, waiting for live sessions to wind down");
                }
                OrchestratorEvent::Error { task_id, message } => match task_id {
                    Some(id) => eprintln!("warning [{}]: {}", id, message),
                    None => eprintln!("warning: {}", message),
                },
            }
        }
    });

    // First Ctrl-C stops gracefully; the runtime's default handler takes
    // over after that.
    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            clog!("Ctrl-C received, requesting stop");
            stop.stop();
        }
    });

    let summary = orchestrator.execute(tasks).await?;
    drop(orchestrator);
    let _ = printer.await;

    println!(
        "done: {}/{} completed, {} failed, {} cancelled",
        summary.completed, summary.total, summary.failed, summary.cancelled
    );
    if summary.all_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    convoy::log::init_with_debug(cli.debug);

    let result = match &cli.command {
        Commands::Plan {
            tasks,
            max_parallel,
        } => plan(tasks, *max_parallel).await,
        Commands::Run {
            tasks,
            repo,
            max_parallel,
            no_merge,
            dry_run,
        } => run(tasks, repo, *max_parallel, *no_merge, *dry_run).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
