//! Terminal-multiplexer driver
//!
//! The console talks to agent sessions exclusively through the
//! [`TerminalDriver`] trait. [`TmuxDriver`] shells out to tmux on a dedicated
//! socket per instance; [`FakeDriver`] serves scripted captures for tests.

mod fake;
mod tmux;

use std::path::PathBuf;

use async_trait::async_trait;

pub use fake::FakeDriver;
pub use tmux::TmuxDriver;

/// Error types for driver operations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("Driver command failed: {0}")]
    CommandFailed(String),
}

/// Parameters for creating a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Session name (see [`session_name`])
    pub name: String,
    /// Working directory for the spawned command
    pub cwd: PathBuf,
    /// Command launched in the session
    pub command: String,
    /// Initial terminal width
    pub cols: u16,
    /// Initial terminal height
    pub rows: u16,
}

/// Session name for an instance ID
pub fn session_name(instance_id: &str) -> String {
    format!("claudio-term-{}", instance_id)
}

/// Socket name for an instance ID
///
/// Each instance gets its own tmux server socket for isolation.
pub fn socket_name(instance_id: &str) -> String {
    format!("claudio-{}", instance_id)
}

/// Abstraction over a terminal multiplexer
#[async_trait]
pub trait TerminalDriver: Send + Sync {
    /// Create a named detached session running `spec.command`
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), DriverError>;

    /// Send a named key (e.g. "Enter", "C-c", "Up")
    async fn send_key(&self, session: &str, key: &str) -> Result<(), DriverError>;

    /// Send literal text, no key-name interpretation
    async fn send_literal(&self, session: &str, text: &str) -> Result<(), DriverError>;

    /// Send text wrapped in bracketed-paste framing
    async fn send_paste(&self, session: &str, text: &str) -> Result<(), DriverError>;

    /// Capture the visible pane contents
    async fn capture(&self, session: &str) -> Result<String, DriverError>;

    /// Capture the visible pane plus `lines` of scrollback
    async fn capture_history(&self, session: &str, lines: u32) -> Result<String, DriverError>;

    /// Resize the session's window
    async fn resize(&self, session: &str, cols: u16, rows: u16) -> Result<(), DriverError>;

    /// Kill the session
    async fn kill_session(&self, session: &str) -> Result<(), DriverError>;

    /// Whether the session currently exists
    async fn session_exists(&self, session: &str) -> bool;
}

/// Produces the driver for a given instance
///
/// Tmux uses one server socket per instance; tests share one fake.
pub trait DriverFactory: Send + Sync {
    fn driver_for(&self, instance_id: &str) -> std::sync::Arc<dyn TerminalDriver>;
}

/// Factory creating per-instance [`TmuxDriver`]s
pub struct TmuxDriverFactory;

impl DriverFactory for TmuxDriverFactory {
    fn driver_for(&self, instance_id: &str) -> std::sync::Arc<dyn TerminalDriver> {
        std::sync::Arc::new(TmuxDriver::for_instance(instance_id))
    }
}
