//! Wave-ordered execution of tasks across parallel agent sessions.
//!
//! The orchestrator drives an `ExecutionPlan` to completion: it walks the
//! waves in order, and within a wave admits tasks into sessions as long as
//! the number of live sessions stays under the global `max_parallel`
//! ceiling. A slot freed by one session's exit immediately admits the next
//! queued task, so the bound holds across the whole run rather than per
//! batch. Failures are tolerated per task: a failed task cancels only its
//! downstream dependents, everything else keeps running.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::Config;
use crate::core::analyzer::{DependencyAnalyzer, ExecutionPlan};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::session::{SessionEvent, SessionId, SessionStatus, TaskSession};
use crate::workspace::WorkspaceManager;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Progress events emitted during an execution, for UIs and logs.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    WaveStarted {
        number: usize,
        task_ids: Vec<TaskId>,
    },
    /// Workspace and session provisioned; the spawn follows immediately.
    SessionCreated {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        session_id: SessionId,
    },
    TaskOutput {
        task_id: TaskId,
        line: String,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    WaveFinished {
        number: usize,
    },
    /// Aggregate progress, emitted whenever a task reaches a terminal
    /// state.
    ProgressUpdate {
        finished: usize,
        total: usize,
        percent: u8,
    },
    ExecutionFinished {
        total: usize,
        completed: usize,
        failed: usize,
        cancelled: usize,
        stopped: bool,
    },
    StopRequested,
    /// Non-fatal problem, reported without changing any task's outcome.
    Error {
        task_id: Option<TaskId>,
        message: String,
    },
}

/// Live view of one session, readable while the execution runs.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub status: SessionStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Shared registry of session snapshots. The orchestrator is the only
/// writer; anyone holding the handle may sample it.
pub type SessionRegistry = Arc<RwLock<HashMap<SessionId, SessionSnapshot>>>;

/// Cancels a running execution from outside `execute`'s borrow.
#[derive(Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// Final tally of an execution.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Terminal status per task.
    pub statuses: HashMap<TaskId, TaskStatus>,
}

impl ExecutionSummary {
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }
}

/// Orchestrates one execution over a repository.
///
/// One-shot: after a stop the instance stays stopped; build a new one for
/// another run.
pub struct Orchestrator {
    config: Config,
    repo_path: PathBuf,
    agent: Agent,
    workspaces: WorkspaceManager,
    registry: SessionRegistry,
    stop: CancellationToken,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
    executing: bool,
    /// Merge completed branches back into the base and drop their
    /// workspaces. Failed and cancelled workspaces are always kept for
    /// inspection.
    pub merge_completed: bool,
}

impl Orchestrator {
    pub fn new(config: Config, repo_path: &Path) -> Result<Self> {
        let agent = Agent::from_config(&config);
        let workspaces = WorkspaceManager::new(repo_path, &config)?;
        Ok(Self {
            config,
            repo_path: repo_path.to_path_buf(),
            agent,
            workspaces,
            registry: Arc::new(RwLock::new(HashMap::new())),
            stop: CancellationToken::new(),
            events: None,
            executing: false,
            merge_completed: true,
        })
    }

    /// Register a sink for progress events. Events are best-effort; a full
    /// or dropped receiver never stalls the execution.
    pub fn set_event_sender(&mut self, sender: mpsc::Sender<OrchestratorEvent>) {
        self.events = Some(sender);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn registry(&self) -> SessionRegistry {
        Arc::clone(&self.registry)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Snapshots of all sessions still in `Running` state.
    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.registry
            .read()
            .map(|r| {
                r.values()
                    .filter(|s| s.status == SessionStatus::Running)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.registry.read().ok().and_then(|r| r.get(id).cloned())
    }

    /// Number of sessions currently in `Running` state.
    pub fn running_count(&self) -> usize {
        self.registry
            .read()
            .map(|r| {
                r.values()
                    .filter(|s| s.status == SessionStatus::Running)
                    .count()
            })
            .unwrap_or(0)
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.try_send(event);
        }
    }

    /// Plan and run `tasks` to completion, a stop request, or exhaustion.
    ///
    /// Dependency cycles and agent unavailability fail fast before any
    /// workspace is touched. Individual task failures do not abort the
    /// run; they cancel only the tasks that depend on them.
    pub async fn execute(&mut self, tasks: Vec<Task>) -> Result<ExecutionSummary> {
        if self.executing {
            return Err(Error::ExecutionInProgress);
        }
        if !self.agent.is_available() {
            return Err(Error::AgentNotAvailable(self.agent.binary().to_string()));
        }

        let plan = DependencyAnalyzer::analyze(&tasks, self.config.max_parallel)?;
        clog!(
            "Executing plan: {} tasks in {} waves (parallelism {})",
            plan.total_tasks,
            plan.wave_count(),
            plan.estimated_parallelism
        );

        self.executing = true;
        let result = self.run_plan(plan).await;
        self.executing = false;
        result
    }

    async fn run_plan(&mut self, plan: ExecutionPlan) -> Result<ExecutionSummary> {
        let max_parallel = self.config.max_parallel.max(1);
        let grace = Duration::from_millis(self.config.stop_grace_ms);
        let base_ref = None::<String>;

        let mut statuses: HashMap<TaskId, TaskStatus> = plan
            .waves
            .iter()
            .flat_map(|w| w.tasks.iter())
            .map(|t| (t.id.clone(), TaskStatus::Pending))
            .collect();
        let total = statuses.len();

        // One channel per execution; sessions hold clones of the sender.
        let (tx, mut rx) = mpsc::channel::<SessionEvent>(1024);
        let mut stopping = false;

        'waves: for wave in &plan.waves {
            if stopping {
                break;
            }
            self.emit(OrchestratorEvent::WaveStarted {
                number: wave.number,
                task_ids: wave.tasks.iter().map(|t| t.id.clone()).collect(),
            });
            clog!("Wave {} starting with {} tasks", wave.number, wave.len());

            // Tasks whose dependencies did not complete are skipped up
            // front and count as cancelled.
            let mut queue: VecDeque<Task> = VecDeque::new();
            for task in &wave.tasks {
                let deps_ok = task.dependencies.iter().all(|dep| {
                    statuses
                        .get(dep)
                        .map(|s| !matches!(s, TaskStatus::Failed { .. } | TaskStatus::Cancelled))
                        .unwrap_or(true)
                });
                if deps_ok {
                    queue.push_back(task.clone());
                } else {
                    clog_warn!("Skipping task {}: a dependency did not complete", task.id);
                    statuses.insert(task.id.clone(), TaskStatus::Cancelled);
                    self.emit(OrchestratorEvent::TaskCancelled {
                        task_id: task.id.clone(),
                    });
                }
            }

            let mut active: HashMap<SessionId, TaskSession> = HashMap::new();

            while !queue.is_empty() || !active.is_empty() {
                // Admission: fill free slots under the global ceiling. The
                // token check keeps a stop that lands between events (or
                // before execute) from admitting another burst.
                while !stopping && !self.stop.is_cancelled() && active.len() < max_parallel {
                    let Some(task) = queue.pop_front() else { break };
                    match self.launch(&task, base_ref.as_deref(), grace, tx.clone()).await {
                        Ok(session) => {
                            statuses.insert(task.id.clone(), TaskStatus::Running);
                            self.track(&session);
                            self.emit(OrchestratorEvent::TaskStarted {
                                task_id: task.id.clone(),
                                session_id: session.id(),
                            });
                            active.insert(session.id(), session);
                        }
                        Err(e) => {
                            clog_warn!("Failed to launch task {}: {}", task.id, e);
                            statuses.insert(
                                task.id.clone(),
                                TaskStatus::Failed {
                                    error: e.to_string(),
                                },
                            );
                            self.emit(OrchestratorEvent::TaskFailed {
                                task_id: task.id.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }

                if queue.is_empty() && active.is_empty() {
                    break;
                }

                let event = if stopping {
                    rx.recv().await
                } else {
                    tokio::select! {
                        ev = rx.recv() => ev,
                        _ = self.stop.cancelled() => {
                            clog!("Stop requested, cancelling {} live sessions", active.len());
                            self.emit(OrchestratorEvent::StopRequested);
                            stopping = true;
                            for task in queue.drain(..) {
                                statuses.insert(task.id.clone(), TaskStatus::Cancelled);
                                self.emit(OrchestratorEvent::TaskCancelled { task_id: task.id });
                            }
                            for session in active.values() {
                                session.stop();
                            }
                            continue;
                        }
                    }
                };

                match event {
                    Some(SessionEvent::Output { task_id, line, .. }) => {
                        self.emit(OrchestratorEvent::TaskOutput { task_id, line });
                    }
                    Some(SessionEvent::Started { .. }) => {}
                    Some(SessionEvent::Exited {
                        session_id,
                        task_id,
                        status,
                    }) => {
                        if let Some(mut session) = active.remove(&session_id) {
                            // Reap the monitor task before the session drops.
                            let _ = session.wait().await;
                        }
                        self.untrack(session_id, &status);
                        self.finish_task(&task_id, status, &mut statuses).await;
                        self.emit_progress(&statuses, total);
                    }
                    // Unreachable while we hold `tx`, but harmless.
                    None => break 'waves,
                }
            }

            self.emit(OrchestratorEvent::WaveFinished {
                number: wave.number,
            });
            clog!("Wave {} finished", wave.number);
        }

        // Anything never reached (later waves after a stop) is cancelled.
        for (task_id, status) in statuses.iter_mut() {
            if !status.is_terminal() {
                *status = TaskStatus::Cancelled;
                self.emit(OrchestratorEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
            }
        }

        let summary = summarize(total, statuses);
        self.emit(OrchestratorEvent::ExecutionFinished {
            total: summary.total,
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
            stopped: stopping,
        });
        clog!(
            "Execution finished: {}/{} completed, {} failed, {} cancelled",
            summary.completed,
            summary.total,
            summary.failed,
            summary.cancelled
        );
        Ok(summary)
    }

    fn emit_progress(&self, statuses: &HashMap<TaskId, TaskStatus>, total: usize) {
        let finished = statuses.values().filter(|s| s.is_terminal()).count();
        let percent = if total == 0 {
            100
        } else {
            ((finished * 100) / total) as u8
        };
        self.emit(OrchestratorEvent::ProgressUpdate {
            finished,
            total,
            percent,
        });
    }

    /// Create the workspace and spawn the session for one task.
    async fn launch(
        &mut self,
        task: &Task,
        base_ref: Option<&str>,
        grace: Duration,
        tx: mpsc::Sender<SessionEvent>,
    ) -> Result<TaskSession> {
        let workspace = self.workspaces.create(task, base_ref).await?;
        self.emit(OrchestratorEvent::SessionCreated {
            task_id: task.id.clone(),
        });
        let command = self.agent.command(Some(&task.title));
        let mut session = TaskSession::new(
            task.id.clone(),
            command,
            &workspace.path,
            self.config.output_cap_bytes,
            self.config.success_marker.clone(),
            grace,
        );
        if let Err(e) = session.start(tx).await {
            // Roll the workspace back so a retry can recreate it.
            if let Err(remove_err) = self.workspaces.remove(&task.id, true).await {
                clog_warn!(
                    "Workspace rollback failed for {}: {}",
                    task.id,
                    remove_err
                );
                self.emit(OrchestratorEvent::Error {
                    task_id: Some(task.id.clone()),
                    message: format!("workspace rollback failed: {}", remove_err),
                });
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Record a session's terminal status and handle its workspace.
    async fn finish_task(
        &mut self,
        task_id: &TaskId,
        status: SessionStatus,
        statuses: &mut HashMap<TaskId, TaskStatus>,
    ) {
        match status {
            SessionStatus::Completed => {
                statuses.insert(task_id.clone(), TaskStatus::Completed);
                self.emit(OrchestratorEvent::TaskCompleted {
                    task_id: task_id.clone(),
                });
                if self.merge_completed {
                    if let Err(e) = self.workspaces.merge(task_id, None).await {
                        clog_warn!("Merge failed for {}: {}", task_id, e);
                        statuses.insert(
                            task_id.clone(),
                            TaskStatus::Failed {
                                error: format!("merge failed: {}", e),
                            },
                        );
                        self.emit(OrchestratorEvent::TaskFailed {
                            task_id: task_id.clone(),
                            error: e.to_string(),
                        });
                        return;
                    }
                    if let Err(e) = self.workspaces.remove(task_id, true).await {
                        clog_warn!("Workspace cleanup failed for {}: {}", task_id, e);
                        self.emit(OrchestratorEvent::Error {
                            task_id: Some(task_id.clone()),
                            message: format!("workspace cleanup failed: {}", e),
                        });
                    }
                }
            }
            SessionStatus::Failed { error } => {
                clog_warn!("Task {} failed: {}", task_id, error);
                statuses.insert(task_id.clone(), TaskStatus::Failed { error: error.clone() });
                self.emit(OrchestratorEvent::TaskFailed {
                    task_id: task_id.clone(),
                    error,
                });
            }
            SessionStatus::Cancelled => {
                statuses.insert(task_id.clone(), TaskStatus::Cancelled);
                self.emit(OrchestratorEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
            }
            // A session never exits into a non-terminal state.
            SessionStatus::Pending | SessionStatus::Running => {
                clog_debug!("Ignoring non-terminal exit status for {}", task_id);
            }
        }
    }

    fn track(&self, session: &TaskSession) {
        if let Ok(mut registry) = self.registry.write() {
            registry.insert(
                session.id(),
                SessionSnapshot {
                    session_id: session.id(),
                    task_id: session.task_id().clone(),
                    status: SessionStatus::Running,
                    started_at: chrono::Utc::now(),
                    finished_at: None,
                },
            );
        }
    }

    fn untrack(&self, session_id: SessionId, status: &SessionStatus) {
        if let Ok(mut registry) = self.registry.write() {
            if let Some(snapshot) = registry.get_mut(&session_id) {
                snapshot.status = status.clone();
                snapshot.finished_at = Some(chrono::Utc::now());
            }
        }
    }
}

fn summarize(total: usize, statuses: HashMap<TaskId, TaskStatus>) -> ExecutionSummary {
    let completed = statuses
        .values()
        .filter(|s| matches!(s, TaskStatus::Completed))
        .count();
    let failed = statuses
        .values()
        .filter(|s| matches!(s, TaskStatus::Failed { .. }))
        .count();
    let cancelled = statuses
        .values()
        .filter(|s| matches!(s, TaskStatus::Cancelled))
        .count();
    ExecutionSummary {
        total,
        completed,
        failed,
        cancelled,
        statuses,
    }
}
