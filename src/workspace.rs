//! Per-task isolated workspaces.
//!
//! Each task gets its own git branch checked out into its own worktree so
//! that parallel agent sessions never write to the same working copy. The
//! manager tracks live workspaces by task id and owns their lifecycle:
//! create, merge back, remove.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::task::{Task, TaskId};
use crate::git::GitOps;
use crate::util::{blocking, sanitize_ref_component};
use crate::{clog, clog_debug, Error, Result};

/// Prefix for all branches the manager creates.
pub const BRANCH_PREFIX: &str = "convoy/";

/// A live task workspace: one branch, one worktree directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub task_id: TaskId,
    pub branch: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view over the tracked workspaces.
#[derive(Debug, Clone)]
pub struct WorkspaceStats {
    pub total: usize,
    pub root: PathBuf,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Creates and tears down worktree-backed workspaces for tasks.
///
/// Tracking is in-memory only; a restart loses the map, but
/// `prune_stale` reconciles against what git still knows about.
pub struct WorkspaceManager {
    repo_path: PathBuf,
    root: PathBuf,
    workspaces: HashMap<TaskId, Workspace>,
}

impl WorkspaceManager {
    /// Open the repository at `repo_path` and prepare the workspace root
    /// under the configured workspaces directory, namespaced by repo name.
    pub fn new(repo_path: &Path, config: &Config) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let root = config.workspaces_dir()?.join(git.repo_name());
        clog_debug!(
            "WorkspaceManager::new repo={} root={}",
            repo_path.display(),
            root.display()
        );
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            root,
            workspaces: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Branch name for a task: `convoy/<sanitized-id>`.
    pub fn branch_name(task_id: &TaskId) -> String {
        format!("{}{}", BRANCH_PREFIX, sanitize_ref_component(task_id.as_str()))
    }

    /// Create a workspace for `task`: a fresh branch off `base_ref`
    /// (default: current HEAD) checked out into a new worktree.
    ///
    /// # Errors
    ///
    /// `WorkspaceExists` if the task already has a tracked workspace;
    /// `Validation` if the branch name is already taken in the repo.
    pub async fn create(&mut self, task: &Task, base_ref: Option<&str>) -> Result<Workspace> {
        if self.workspaces.contains_key(&task.id) {
            return Err(Error::WorkspaceExists(task.id.clone()));
        }

        let branch = Self::branch_name(&task.id);
        let path = self
            .root
            .join(sanitize_ref_component(task.id.as_str()));
        let repo_path = self.repo_path.clone();
        let base = base_ref.map(String::from);

        clog!(
            "Creating workspace for task {} (branch {}, path {})",
            task.id,
            branch,
            path.display()
        );

        let (branch, path) = blocking(move || {
            let git = GitOps::new(&repo_path)?;
            if git.branch_exists(&branch)? {
                return Err(Error::Validation(format!(
                    "branch '{}' already exists",
                    branch
                )));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            git.create_worktree(&branch, &path, base.as_deref())?;
            Ok((branch, path))
        })
        .await?;

        let workspace = Workspace {
            task_id: task.id.clone(),
            branch,
            path,
            created_at: Utc::now(),
        };
        self.workspaces.insert(task.id.clone(), workspace.clone());
        Ok(workspace)
    }

    /// Remove a task's workspace: prune the worktree, delete its directory
    /// and optionally delete the branch.
    ///
    /// Branch deletion is best-effort; the worktree removal is what frees
    /// the disk and the checkout lock.
    pub async fn remove(&mut self, task_id: &TaskId, delete_branch: bool) -> Result<()> {
        let workspace = self
            .workspaces
            .remove(task_id)
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;

        clog!(
            "Removing workspace for task {} (branch {})",
            task_id,
            workspace.branch
        );

        let repo_path = self.repo_path.clone();
        let result = blocking(move || {
            let git = GitOps::new(&repo_path)?;
            git.remove_worktree(&workspace.path)?;
            if delete_branch {
                git.delete_branch(&workspace.branch)?;
            }
            git.prune_worktrees()?;
            Ok(())
        })
        .await;

        if result.is_err() {
            // Keep it untracked: the caller asked for removal, and a
            // half-removed worktree can still be pruned later.
            clog_debug!("Workspace removal for {} reported an error", task_id);
        }
        result
    }

    /// Merge a task's branch back into `target` (default: the branch that
    /// was HEAD when the merge runs). The workspace stays tracked; callers
    /// usually follow up with `remove`.
    pub async fn merge(&mut self, task_id: &TaskId, target: Option<&str>) -> Result<()> {
        let workspace = self
            .workspaces
            .get(task_id)
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.clone()))?;

        let branch = workspace.branch.clone();
        let repo_path = self.repo_path.clone();
        let target = target.map(String::from);

        clog!("Merging branch {} for task {}", branch, task_id);

        blocking(move || {
            let git = GitOps::new(&repo_path)?;
            git.merge_branch(&branch, target.as_deref())
        })
        .await
    }

    /// Remove every tracked workspace, best-effort. One bad worktree never
    /// strands the rest; failures come back paired with their task id.
    pub async fn remove_all(&mut self, delete_branches: bool) -> Vec<(TaskId, Error)> {
        let ids: Vec<TaskId> = self.workspaces.keys().cloned().collect();
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.remove(&id, delete_branches).await {
                clog_debug!("remove_all: failed for {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Drop git's records of worktrees whose directories no longer exist.
    pub async fn prune_stale(&self) -> Result<()> {
        let repo_path = self.repo_path.clone();
        blocking(move || {
            let git = GitOps::new(&repo_path)?;
            git.prune_worktrees()
        })
        .await
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&Workspace> {
        self.workspaces.get(task_id)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.workspaces.contains_key(task_id)
    }

    pub fn list(&self) -> Vec<&Workspace> {
        self.workspaces.values().collect()
    }

    pub fn count(&self) -> usize {
        self.workspaces.len()
    }

    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            total: self.workspaces.len(),
            root: self.root.clone(),
            oldest: self.workspaces.values().map(|w| w.created_at).min(),
            newest: self.workspaces.values().map(|w| w.created_at).max(),
        }
    }
}
