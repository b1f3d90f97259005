use std::path::{Path, PathBuf};

use git2::{Commit, ErrorCode, Repository};

use crate::{clog_debug, clog_warn, Error, Result};

/// Thin wrapper over git2 for the worktree and merge operations the
/// workspace manager needs. Re-discovers the repository per call so the
/// handle stays cheap to clone into blocking closures.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Resolve a ref name (branch, tag or revspec) to its commit. `None`
    /// resolves to the current HEAD.
    fn resolve_commit<'r>(&self, repo: &'r Repository, base_ref: Option<&str>) -> Result<Commit<'r>> {
        match base_ref {
            Some(spec) => Ok(repo.revparse_single(spec)?.peel_to_commit()?),
            None => Ok(repo.head()?.peel_to_commit()?),
        }
    }

    /// Create a branch off `base_ref` (default: current HEAD) and check it
    /// out into a new worktree at `worktree_path`.
    pub fn create_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base_ref: Option<&str>,
    ) -> Result<()> {
        clog_debug!(
            "GitOps::create_worktree branch={} path={} base={:?}",
            branch,
            worktree_path.display(),
            base_ref
        );
        let repo = self.repo()?;
        let commit = self.resolve_commit(&repo, base_ref)?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Use the worktree folder name as the worktree name (branch may
        // contain slashes)
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        clog_debug!("Worktree created: {}", worktree_name);
        Ok(())
    }

    /// Remove a worktree and clean up all associated resources.
    ///
    /// Attempts cleanup even if some operations fail. The branch must be
    /// fully disassociated from the worktree, otherwise later branch
    /// deletion fails with "branch is already checked out".
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        clog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        // Find the worktree by path, falling back to folder name (path
        // canonicalization can make the direct comparison fail)
        let by_path: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(|s| s.to_string());

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name = by_path.or_else(|| {
            folder_name.as_ref().and_then(|fname| {
                worktrees
                    .iter()
                    .flatten()
                    .find(|name| *name == fname.as_str())
                    .map(|s| s.to_string())
            })
        });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune_result = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune_result {
                    clog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // Clean up the git worktree admin directory (.git/worktrees/<name>).
        // If the admin dir still exists, git thinks the branch is checked out.
        if let Some(ref name) = worktree_name {
            self.cleanup_worktree_admin_dir(name);
        }
        if let Some(ref fname) = folder_name {
            self.cleanup_worktree_admin_dir(fname);
        }

        clog_debug!("Worktree removed: {}", worktree_path.display());
        Ok(())
    }

    fn cleanup_worktree_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Merge `branch` into `target_ref` (default: current branch).
    ///
    /// Fast-forwards when possible, otherwise creates a merge commit.
    /// Conflicting merges are aborted and surfaced as `MergeConflict`;
    /// resolution is left to the caller.
    pub fn merge_branch(&self, branch: &str, target_ref: Option<&str>) -> Result<()> {
        clog_debug!("GitOps::merge_branch branch={} target={:?}", branch, target_ref);
        let repo = self.repo()?;

        let target_name = match target_ref {
            Some(name) => name.to_string(),
            None => self.current_head()?,
        };

        let target_branch = repo.find_branch(&target_name, git2::BranchType::Local)?;
        let target_commit = target_branch.get().peel_to_commit()?;
        let source_branch = repo.find_branch(branch, git2::BranchType::Local)?;
        let source_commit = source_branch.get().peel_to_commit()?;

        if source_commit.id() == target_commit.id()
            || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            clog_debug!("Merge is a no-op, target already contains {}", branch);
            return Ok(());
        }

        let refname = format!("refs/heads/{}", target_name);

        if repo.graph_descendant_of(source_commit.id(), target_commit.id())? {
            // Fast-forward: move the target ref onto the source commit
            let mut reference = repo.find_reference(&refname)?;
            reference.set_target(
                source_commit.id(),
                &format!("convoy: fast-forward {} to {}", target_name, branch),
            )?;
            clog_debug!("Fast-forwarded {} to {}", target_name, branch);
            return Ok(());
        }

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            return Err(Error::MergeConflict {
                branch: branch.to_string(),
                target: target_name,
            });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("Convoy", "convoy@localhost"))?;
        let message = format!("Merge branch '{}' into {}", branch, target_name);
        let commit_id = repo.commit(
            Some(&refname),
            &sig,
            &sig,
            &message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        clog_debug!("Merge commit created: {}", commit_id);
        Ok(())
    }

    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        // The Branch borrows `repo`, so collapse to bool before returning.
        let found = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(found)
    }

    /// Delete a local branch. Returns Ok even if the branch doesn't exist.
    /// Logs a warning if deletion fails for other reasons but doesn't error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        clog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    // The branch might be checked out elsewhere; the
                    // important thing is the worktree is gone.
                    clog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                clog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                clog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Prune stale git worktree administrative files. Important after
    /// worktree directories were removed directly.
    pub fn prune_worktrees(&self) -> Result<()> {
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;
        for worktree_name in worktrees.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(worktree_name) {
                if !worktree.path().exists() {
                    let _ = worktree.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}
