//! Agent process sessions.
//!
//! A `TaskSession` supervises one external agent process working on one
//! task: it spawns the process in the task's workspace, streams stdout and
//! stderr into a byte-capped buffer, forwards output and lifecycle events
//! over a channel, and classifies the exit. The exit code is the
//! authoritative completion signal; a configured success marker in the
//! output is recorded but never overrides it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Unique identifier for a session. Generated per spawn, so a retried
/// task gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(8).collect()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state.
///
/// Like task status, transitions are monotone and nothing leaves a
/// terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created but not yet spawned.
    Pending,
    /// Process is alive.
    Running,
    /// Process exited with code 0.
    Completed,
    /// Process exited with a nonzero code, or spawning failed.
    Failed { error: String },
    /// Process was stopped before exiting on its own, or died to a signal.
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed { .. } | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed { error } => write!(f, "failed: {}", error),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events a session emits over its channel.
///
/// All `Output` events for a session are delivered before its `Exited`
/// event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        session_id: SessionId,
        task_id: TaskId,
    },
    Output {
        session_id: SessionId,
        task_id: TaskId,
        line: String,
    },
    Exited {
        session_id: SessionId,
        task_id: TaskId,
        status: SessionStatus,
    },
}

/// Byte-capped output buffer. When the cap is exceeded the oldest whole
/// lines are dropped first; a single oversized line keeps only its tail.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            cap: cap.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.lines.push_back(line.to_string());
        self.bytes += line.len();
        while self.bytes > self.cap && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                self.truncated = true;
            }
        }
        // A single line larger than the cap keeps its tail only.
        if self.bytes > self.cap {
            if let Some(only) = self.lines.front_mut() {
                let excess = only.len() - self.cap;
                let mut cut = excess;
                while cut < only.len() && !only.is_char_boundary(cut) {
                    cut += 1;
                }
                *only = only.split_off(cut);
                self.bytes = only.len();
                self.truncated = true;
            }
        }
    }

    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.bytes + self.lines.len());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// State shared between the session handle and its background tasks.
struct Shared {
    output: Mutex<OutputBuffer>,
    status: Mutex<SessionStatus>,
    marker_seen: AtomicBool,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        if let Ok(mut guard) = self.status.lock() {
            if !guard.is_terminal() {
                *guard = status;
            }
        }
    }
}

/// Handles owned only while the process runs.
struct Running {
    stdin: Option<ChildStdin>,
    cancel: CancellationToken,
    /// Taken by the first `wait`; later waits just read the status.
    monitor: Option<JoinHandle<()>>,
}

/// One supervised agent process for one task.
pub struct TaskSession {
    id: SessionId,
    task_id: TaskId,
    command: Vec<String>,
    workdir: PathBuf,
    marker: Option<String>,
    grace: Duration,
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl TaskSession {
    pub fn new(
        task_id: TaskId,
        command: Vec<String>,
        workdir: &Path,
        output_cap_bytes: usize,
        marker: Option<String>,
        grace: Duration,
    ) -> Self {
        Self {
            id: SessionId::new(),
            task_id,
            command,
            workdir: workdir.to_path_buf(),
            marker,
            grace,
            shared: Arc::new(Shared {
                output: Mutex::new(OutputBuffer::new(output_cap_bytes)),
                status: Mutex::new(SessionStatus::Pending),
                marker_seen: AtomicBool::new(false),
            }),
            running: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared
            .status
            .lock()
            .map(|s| s.clone())
            .unwrap_or(SessionStatus::Failed {
                error: "status lock poisoned".to_string(),
            })
    }

    /// Snapshot of the retained output.
    pub fn output(&self) -> String {
        self.shared
            .output
            .lock()
            .map(|b| b.contents())
            .unwrap_or_default()
    }

    pub fn output_truncated(&self) -> bool {
        self.shared
            .output
            .lock()
            .map(|b| b.is_truncated())
            .unwrap_or(false)
    }

    /// Whether the configured success marker was seen in the output. A
    /// hint only; exit classification never consults it.
    pub fn marker_seen(&self) -> bool {
        self.shared.marker_seen.load(Ordering::Relaxed)
    }

    /// Spawn the agent process and begin supervision.
    ///
    /// Emits `Started` once the process is up; `Output` per line; exactly
    /// one `Exited` when the process is gone. Output events always precede
    /// the exit event.
    pub async fn start(&mut self, events: mpsc::Sender<SessionEvent>) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::Validation(format!(
                "session {} already started",
                self.id.short()
            )));
        }
        let program = self
            .command
            .first()
            .cloned()
            .ok_or_else(|| Error::Validation("empty agent command".to_string()))?;

        clog!(
            "Starting session {} for task {} in {}",
            self.id.short(),
            self.task_id,
            self.workdir.display()
        );

        let mut child = Command::new(&program)
            .args(&self.command[1..])
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;

        self.shared.set_status(SessionStatus::Running);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(spawn_reader(
                BufReader::new(out),
                self.id,
                self.task_id.clone(),
                Arc::clone(&self.shared),
                self.marker.clone(),
                events.clone(),
            ));
        }
        if let Some(err) = stderr {
            readers.push(spawn_reader(
                BufReader::new(err),
                self.id,
                self.task_id.clone(),
                Arc::clone(&self.shared),
                self.marker.clone(),
                events.clone(),
            ));
        }

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            child,
            readers,
            self.id,
            self.task_id.clone(),
            Arc::clone(&self.shared),
            cancel.clone(),
            self.grace,
            events.clone(),
        ));

        let _ = events
            .send(SessionEvent::Started {
                session_id: self.id,
                task_id: self.task_id.clone(),
            })
            .await;

        self.running = Some(Running {
            stdin,
            cancel,
            monitor: Some(monitor),
        });
        Ok(())
    }

    /// Write a line to the agent's stdin. Only valid while the process is
    /// running; before start and after exit it fails the same way.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        if self.status() != SessionStatus::Running {
            return Err(Error::SessionNotStarted(self.id));
        }
        let running = self
            .running
            .as_mut()
            .ok_or(Error::SessionNotStarted(self.id))?;
        let stdin = running
            .stdin
            .as_mut()
            .ok_or(Error::SessionNotStarted(self.id))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close the agent's stdin, signalling end of input.
    pub fn close_stdin(&mut self) {
        if let Some(running) = self.running.as_mut() {
            running.stdin = None;
        }
    }

    /// Request the session to stop. Idempotent; safe to call on an
    /// already-exited session. The monitor grants the process the
    /// configured grace period before killing it.
    pub fn stop(&self) {
        if let Some(running) = &self.running {
            clog_debug!("Stop requested for session {}", self.id.short());
            running.cancel.cancel();
        }
    }

    /// Wait for the session to reach a terminal status.
    pub async fn wait(&mut self) -> Result<SessionStatus> {
        if let Some(running) = self.running.as_mut() {
            // Close stdin so a line-reading agent sees EOF instead of
            // blocking forever on more input.
            running.stdin = None;
            if let Some(monitor) = running.monitor.take() {
                monitor
                    .await
                    .map_err(|e| Error::TaskJoin(e.to_string()))?;
            }
        }
        Ok(self.status())
    }

    /// Stop and reap: cancel, then wait for the process to be gone.
    pub async fn destroy(&mut self) -> Result<SessionStatus> {
        self.stop();
        self.wait().await
    }
}

fn spawn_reader<R>(
    reader: BufReader<R>,
    session_id: SessionId,
    task_id: TaskId,
    shared: Arc<Shared>,
    marker: Option<String>,
    events: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(m) = &marker {
                        if line.contains(m.as_str()) {
                            shared.marker_seen.store(true, Ordering::Relaxed);
                        }
                    }
                    if let Ok(mut buf) = shared.output.lock() {
                        buf.push(&line);
                    }
                    let _ = events
                        .send(SessionEvent::Output {
                            session_id,
                            task_id: task_id.clone(),
                            line,
                        })
                        .await;
                }
                Ok(None) => break,
                Err(e) => {
                    clog_warn!("Session {} output read error: {}", session_id.short(), e);
                    break;
                }
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn monitor(
    mut child: Child,
    mut readers: Vec<JoinHandle<()>>,
    session_id: SessionId,
    task_id: TaskId,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    grace: Duration,
    events: mpsc::Sender<SessionEvent>,
) {
    let status = tokio::select! {
        exit = child.wait() => match exit {
            Ok(exit) => classify_exit(exit),
            Err(e) => SessionStatus::Failed {
                error: format!("wait failed: {}", e),
            },
        },
        _ = cancel.cancelled() => {
            // One grace period for a voluntary exit, then the kill. The
            // child still counts as cancelled either way.
            match timeout(grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    if let Err(e) = child.start_kill() {
                        clog_warn!(
                            "Kill failed for session {}: {}",
                            session_id.short(),
                            e
                        );
                    }
                    let _ = child.wait().await;
                }
            }
            SessionStatus::Cancelled
        }
    };

    // Readers normally hit EOF the moment the process is gone, and
    // draining them first keeps every Output event ahead of Exited. A
    // grandchild that inherited the pipes can hold them open long after
    // the kill, so the drain gets one grace period and no more.
    if timeout(grace, futures::future::join_all(readers.iter_mut()))
        .await
        .is_err()
    {
        clog_warn!(
            "Session {} output pipes still open after grace, abandoning drain",
            session_id.short()
        );
        for reader in &readers {
            reader.abort();
        }
    }

    clog!(
        "Session {} for task {} exited: {}",
        session_id.short(),
        task_id,
        status
    );
    shared.set_status(status.clone());
    let _ = events
        .send(SessionEvent::Exited {
            session_id,
            task_id,
            status,
        })
        .await;
}

/// Exit code 0 is success, any other code a failure, and a signal death
/// (no code at all) counts as cancelled.
fn classify_exit(exit: std::process::ExitStatus) -> SessionStatus {
    match exit.code() {
        Some(0) => SessionStatus::Completed,
        Some(code) => SessionStatus::Failed {
            error: format!("exit code {}", code),
        },
        None => SessionStatus::Cancelled,
    }
}
