//! Instance model - one supervised agent worker

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::driver::session_name;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created; worktree may still be provisioning
    Pending,
    /// Agent session running and producing output
    Working,
    /// Agent blocked on user input (permission, question, or prompt)
    WaitingInput,
    /// Capture suspended; session alive
    Paused,
    /// Agent finished its task
    Completed,
    /// Agent or driver failed
    Error,
    /// A pull request is being created for this instance
    CreatingPr,
    /// Stale output crossed the stuck threshold
    Stuck,
    /// Activity or completion timeout crossed
    Timeout,
}

impl InstanceStatus {
    /// Terminal states end supervision until an explicit restart
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stuck | Self::Timeout)
    }

    /// States in which the capture loop is expected to be running
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Working | Self::WaitingInput | Self::CreatingPr)
    }

    /// Whether a transition to `to` is legal
    ///
    /// `Completed`, once set, is only left through an explicit restart
    /// (modeled as `Completed -> Working`). `Paused` is an orthogonal hold
    /// available from any live state.
    pub fn can_transition(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if *self == to {
            return true;
        }
        match (*self, to) {
            // Pending -> Error covers worktree provisioning failures
            (Pending, Working | Error) => true,
            (Working, WaitingInput | Completed | Error | Stuck | Timeout | CreatingPr | Paused) => true,
            (WaitingInput, Working | Completed | Error | Stuck | Timeout | Paused) => true,
            (CreatingPr, Working | Completed | Error) => true,
            (Paused, Working | WaitingInput) => true,
            // Explicit restart from any terminal state
            (Completed | Error | Stuck | Timeout, Working) => true,
            _ => false,
        }
    }

    /// One-character sidebar indicator
    pub fn indicator(&self) -> char {
        match self {
            Self::Pending => '·',
            Self::Working => '▶',
            Self::WaitingInput => '?',
            Self::Paused => '⏸',
            Self::Completed => '✓',
            Self::Error => '✗',
            Self::CreatingPr => '↑',
            Self::Stuck => '!',
            Self::Timeout => '⏱',
        }
    }
}

/// Error for illegal status transitions
#[derive(Debug, thiserror::Error)]
#[error("Illegal status transition for {id}: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub id: String,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// Usage metrics reported by the agent; opaque passthrough for display
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub api_calls: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One supervised agent worker
///
/// Owns exactly one terminal session and one worktree. Captured output is
/// runtime state, never persisted; it is re-derived from the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub created_at: DateTime<Utc>,

    /// Free-text task assigned to the agent
    pub task: String,

    /// Branch the worktree was created on
    pub branch: String,

    /// Filesystem checkout exclusively owned by this instance
    pub worktree_path: PathBuf,

    /// Repository the worktree was created from
    pub base_repo: PathBuf,

    pub status: InstanceStatus,

    /// Handle into the terminal driver
    pub session_name: String,

    /// Instance ids that must reach Completed before this one may start
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Status held when the orthogonal pause was entered; resume restores it
    /// exactly, so pause then resume is observationally a no-op
    #[serde(default)]
    pub paused_from: Option<InstanceStatus>,

    /// Worktree provisioning finished (two-phase add)
    #[serde(default)]
    pub worktree_ready: bool,

    #[serde(default)]
    pub metrics: InstanceMetrics,
}

impl Instance {
    /// Create a pending instance with a fresh short id
    pub fn new(task: impl Into<String>, base_repo: impl Into<PathBuf>, worktree_dir: &std::path::Path, branch_prefix: &str) -> Self {
        let id = short_id();
        let task = task.into();
        Self {
            session_name: session_name(&id),
            branch: format!("{}/{}", branch_prefix, id),
            worktree_path: worktree_dir.join(&id),
            created_at: Utc::now(),
            status: InstanceStatus::Pending,
            depends_on: Vec::new(),
            paused_from: None,
            worktree_ready: false,
            metrics: InstanceMetrics::default(),
            base_repo: base_repo.into(),
            task,
            id,
        }
    }

    /// Apply a status transition, rejecting illegal ones
    pub fn transition(&mut self, to: InstanceStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition(to) {
            return Err(IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        if self.status != to {
            tracing::debug!(id = %self.id, from = ?self.status, to = ?to, "Instance::transition");
        }
        self.status = to;
        Ok(())
    }

    /// Whether this instance may start now given the states of its parents
    pub fn deps_satisfied(&self, status_of: impl Fn(&str) -> Option<InstanceStatus>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| status_of(dep) == Some(InstanceStatus::Completed))
    }
}

/// Short, stable instance id (uuid v4 prefix)
pub fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
