//! Shared fixtures: a throwaway git repository plus helpers for building
//! configs and fake-agent scripts.

use std::path::{Path, PathBuf};

use git2::{Repository, Signature};
use tempfile::TempDir;

use convoy::Config;

/// A temporary git repository with one initial commit, plus scratch space
/// for scripts and per-test workspaces.
pub struct TestRepo {
    pub tmp: TempDir,
    pub repo_dir: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let repo_dir = tmp.path().join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();

        let repo = Repository::init(&repo_dir).unwrap();
        let sig = Signature::now("Test", "test@localhost").unwrap();
        std::fs::write(repo_dir.join("README.md"), "# fixture\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        drop(tree);

        Self { tmp, repo_dir }
    }

    /// Config pointing workspaces at scratch space, with a short stop
    /// grace so cancellation tests stay fast.
    pub fn config(&self, command: &str, max_parallel: usize) -> Config {
        Config {
            max_parallel,
            command: Some(command.to_string()),
            workspace_dir: Some(self.tmp.path().join("ws").to_string_lossy().into_owned()),
            stop_grace_ms: 50,
            ..Default::default()
        }
    }

    /// Write a fake-agent shell script and return the agent command that
    /// runs it. The task title arrives as `$1`.
    pub fn script(&self, name: &str, body: &str) -> String {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    /// Path in scratch space for scripts that record what they did.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }
}
