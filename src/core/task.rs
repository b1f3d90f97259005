//! Task data model for the execution plan.
//!
//! Tasks are the atomic units of work handed to agent sessions. They are
//! produced by an external scanner; convoy treats them as immutable apart
//! from `status`, which only the orchestrator pipeline mutates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Unique identifier for a task.
///
/// Ids are assigned by the external task source, so this is a string
/// newtype rather than a generated UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
///
/// Transitions are monotone: `Pending → Running → {Completed | Failed |
/// Cancelled}`, and nothing leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet started.
    #[default]
    Pending,
    /// Task is currently being executed by an agent session.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed with an error.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task was cancelled before completing.
    Cancelled,
}

impl TaskStatus {
    /// Check whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single unit of work with its dependency set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned by the task source.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Ids of tasks that must complete before this one may start.
    #[serde(default)]
    pub dependencies: HashSet<TaskId>,
    /// Current execution status.
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// Create a new pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            dependencies: HashSet::new(),
            status: TaskStatus::Pending,
        }
    }

    /// Builder-style dependency registration.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Transition to Running. Ignored from a terminal state.
    pub fn start(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Running;
        }
    }

    /// Transition to Completed. Ignored from a terminal state.
    pub fn complete(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Completed;
        }
    }

    /// Transition to Failed. Ignored from a terminal state.
    pub fn fail(&mut self, error: &str) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Failed {
                error: error.to_string(),
            };
        }
    }

    /// Transition to Cancelled. Ignored from a terminal state.
    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Cancelled;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
