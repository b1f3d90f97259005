//! convoy orchestrates many parallel coding-agent processes over a task
//! dependency graph.
//!
//! A task list goes through the [`crate::core::analyzer::DependencyAnalyzer`]
//! to become a wave-ordered [`crate::core::analyzer::ExecutionPlan`]; the
//! [`orchestrator::Orchestrator`] then runs each task in its own
//! [`session::TaskSession`] inside an isolated git-worktree workspace
//! managed by the [`workspace::WorkspaceManager`], keeping the number of
//! live sessions under a global ceiling.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestrator;
pub mod session;
pub mod util;
pub mod workspace;

pub use crate::config::Config;
pub use crate::core::analyzer::{DependencyAnalyzer, ExecutionPlan, Wave};
pub use crate::core::task::{Task, TaskId, TaskStatus};
pub use crate::error::{Error, Result};
pub use crate::orchestrator::{ExecutionSummary, Orchestrator, OrchestratorEvent, StopHandle};
pub use crate::session::{SessionEvent, SessionId, SessionStatus, TaskSession};
pub use crate::workspace::{Workspace, WorkspaceManager};
