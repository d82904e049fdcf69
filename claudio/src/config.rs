//! Claudio configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main Claudio configuration
///
/// Loaded once at startup; coordinators receive an immutable snapshot at
/// construction time. There is no hot reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent process configuration
    pub agent: AgentConfig,

    /// Supervision timeouts
    pub timeouts: TimeoutConfig,

    /// Git / worktree configuration
    pub git: GitConfig,

    /// Workflow defaults
    pub workflows: WorkflowConfig,

    /// UI behaviour
    pub ui: UiConfig,

    /// Log level from the config file (CLI flag takes priority)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path > repo-local `.claudio.yml` > `~/.config/claudio/claudio.yml` > defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".claudio.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("claudio").join("claudio.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Peek at the log level without a full load (logging must init before
    /// config errors can be reported anywhere useful)
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let config = Self::load(config_path).ok()?;
        config.log_level
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Command launched inside each instance session
    pub command: String,

    /// Initial terminal columns for new sessions
    pub cols: u16,

    /// Initial terminal rows for new sessions
    pub rows: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            cols: 200,
            rows: 50,
        }
    }
}

/// Supervision timeouts, all in seconds; 0 disables the check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// No output change while Working for this long raises a stale timeout
    #[serde(rename = "stale-secs")]
    pub stale_secs: u64,

    /// No activity (output change or user input) for this long raises an
    /// activity timeout
    #[serde(rename = "activity-secs")]
    pub activity_secs: u64,

    /// Wall-clock bound on a single instance run
    #[serde(rename = "completion-secs")]
    pub completion_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stale_secs: 120,
            activity_secs: 600,
            completion_secs: 0,
        }
    }
}

/// Git configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Base directory for instance worktrees
    #[serde(rename = "worktree-dir")]
    pub worktree_dir: PathBuf,

    /// Branch prefix for instance branches
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Path prefixes excluded from conflict detection
    #[serde(rename = "conflict-excludes")]
    pub conflict_excludes: Vec<String>,

    /// Seconds between conflict-detector polls
    #[serde(rename = "conflict-poll-secs")]
    pub conflict_poll_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from("/tmp/claudio/worktrees"),
            branch_prefix: "claudio".to_string(),
            conflict_excludes: vec![".claudio/".to_string()],
            conflict_poll_secs: 10,
        }
    }
}

/// Workflow defaults, overridable per command invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Skip user approval gates
    #[serde(rename = "auto-approve")]
    pub auto_approve: bool,

    /// Force the plan editor open before execution
    pub review: bool,

    /// Maximum task instances running concurrently during ultra-plan execution
    #[serde(rename = "max-parallel")]
    pub max_parallel: usize,

    /// Retries for a failed ultra-plan task before it is recorded failed
    #[serde(rename = "max-task-retries")]
    pub max_task_retries: u32,

    /// Bounded synthesis/revision loop count
    #[serde(rename = "max-revisions")]
    pub max_revisions: u32,

    /// Require at least one verified commit before a task counts complete
    #[serde(rename = "require-verified-commits")]
    pub require_verified_commits: bool,

    /// Number of strategy planners in multi-pass planning
    #[serde(rename = "multi-pass-planners")]
    pub multi_pass_planners: usize,

    /// Maximum adversarial rounds before forced completion
    #[serde(rename = "max-adversarial-rounds")]
    pub max_adversarial_rounds: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            review: true,
            max_parallel: 4,
            max_task_retries: 2,
            max_revisions: 3,
            require_verified_commits: true,
            multi_pass_planners: 3,
            max_adversarial_rounds: 5,
        }
    }
}

/// UI behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Milliseconds between update ticks
    #[serde(rename = "tick-ms")]
    pub tick_ms: u64,

    /// Seconds before transient info/error banners auto-dismiss
    #[serde(rename = "message-ttl-secs")]
    pub message_ttl_secs: u64,

    /// Auto-start instances as soon as their worktree is ready
    #[serde(rename = "auto-start")]
    pub auto_start: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            message_ttl_secs: 5,
            auto_start: true,
        }
    }
}
