use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{clog_debug, Error, Result};

/// Default ceiling on simultaneously running sessions.
pub const DEFAULT_MAX_PARALLEL: usize = 10;
/// Default cap on a session's retained output, in bytes (10 MiB).
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;
/// Default grace period granted to a session when stopping, in milliseconds.
pub const DEFAULT_STOP_GRACE_MS: u64 = 1000;

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_output_cap() -> usize {
    DEFAULT_OUTPUT_CAP_BYTES
}

fn default_stop_grace() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Global ceiling on simultaneously running agent sessions.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Agent command line; defaults to `claude` when unset.
    pub command: Option<String>,
    /// Directory for task workspaces; defaults to `~/.convoy/workspaces`.
    pub workspace_dir: Option<String>,
    /// Cap on retained session output, in bytes.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
    /// Grace period per session when stopping an execution, in milliseconds.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
    /// Optional substring hint that the agent prints on success. Exit code
    /// remains authoritative; this is only a secondary signal.
    pub success_marker: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            command: None,
            workspace_dir: None,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            success_marker: None,
        }
    }
}

impl Config {
    pub fn convoy_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".convoy"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::convoy_dir()?.join("convoy.toml"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::convoy_dir()?.join("workspaces")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: max_parallel={}, command={:?}, workspace_dir={:?}",
            config.max_parallel,
            config.command,
            config.workspace_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let convoy_dir = Self::convoy_dir()?;
        clog_debug!("Config::save convoy_dir={}", convoy_dir.display());
        if !convoy_dir.exists() {
            fs::create_dir_all(&convoy_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let convoy_dir = Self::convoy_dir()?;
        let workspaces_dir = self.workspaces_dir()?;
        clog_debug!(
            "Config::ensure_dirs convoy={} workspaces={}",
            convoy_dir.display(),
            workspaces_dir.display()
        );
        if !convoy_dir.exists() {
            fs::create_dir_all(&convoy_dir)?;
        }
        if !workspaces_dir.exists() {
            fs::create_dir_all(&workspaces_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
