use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;
use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Dependency cycle detected: {}", .cycle.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(" -> "))]
    DependencyCycle {
        /// Ordered ids of the tasks forming the cycle.
        cycle: Vec<TaskId>,
    },

    #[error("Invalid execution plan: {0}")]
    PlanValidation(String),

    #[error("Workspace already exists for task: {0}")]
    WorkspaceExists(TaskId),

    #[error("Workspace not found for task: {0}")]
    WorkspaceNotFound(TaskId),

    #[error("Session {0} is not running")]
    SessionNotStarted(SessionId),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("An execution is already in progress")]
    ExecutionInProgress,

    #[error("Merge of '{branch}' into '{target}' produced conflicts")]
    MergeConflict { branch: String, target: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
