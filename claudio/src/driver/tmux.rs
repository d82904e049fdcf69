//! Tmux driver - subprocess implementation of [`TerminalDriver`]

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{DriverError, SessionSpec, TerminalDriver, socket_name};

/// Driver backed by a tmux server on a private socket
pub struct TmuxDriver {
    socket: String,
}

impl TmuxDriver {
    /// Create a driver on a named socket
    pub fn new(socket: impl Into<String>) -> Self {
        Self { socket: socket.into() }
    }

    /// Create the driver for an instance's dedicated socket
    pub fn for_instance(instance_id: &str) -> Self {
        Self::new(socket_name(instance_id))
    }

    /// Run a tmux subcommand on this driver's socket
    async fn run(&self, args: &[&str]) -> Result<std::process::Output, DriverError> {
        debug!(socket = %self.socket, ?args, "TmuxDriver::run");
        Command::new("tmux")
            .arg("-L")
            .arg(&self.socket)
            .args(args)
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed(e.to_string()))
    }

    fn stderr_of(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }
}

#[async_trait]
impl TerminalDriver for TmuxDriver {
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), DriverError> {
        if self.session_exists(&spec.name).await {
            return Err(DriverError::SessionExists(spec.name.clone()));
        }

        let cols = spec.cols.to_string();
        let rows = spec.rows.to_string();
        let cwd = spec.cwd.display().to_string();
        let output = self
            .run(&[
                "new-session",
                "-d",
                "-s",
                &spec.name,
                "-x",
                &cols,
                "-y",
                &rows,
                "-c",
                &cwd,
                &spec.command,
            ])
            .await?;

        if !output.status.success() {
            return Err(DriverError::SpawnFailed(Self::stderr_of(&output)));
        }
        debug!(session = %spec.name, "TmuxDriver::create_session: created");
        Ok(())
    }

    async fn send_key(&self, session: &str, key: &str) -> Result<(), DriverError> {
        let output = self.run(&["send-keys", "-t", session, key]).await?;
        if !output.status.success() {
            return Err(DriverError::SessionNotFound(session.to_string()));
        }
        Ok(())
    }

    async fn send_literal(&self, session: &str, text: &str) -> Result<(), DriverError> {
        let output = self.run(&["send-keys", "-t", session, "-l", text]).await?;
        if !output.status.success() {
            return Err(DriverError::SessionNotFound(session.to_string()));
        }
        Ok(())
    }

    async fn send_paste(&self, session: &str, text: &str) -> Result<(), DriverError> {
        // Stage the text in a tmux buffer, then paste with bracketed framing
        let mut child = Command::new("tmux")
            .arg("-L")
            .arg(&self.socket)
            .args(["load-buffer", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::CommandFailed(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| DriverError::CommandFailed(e.to_string()))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| DriverError::CommandFailed(e.to_string()))?;
        if !status.success() {
            return Err(DriverError::CommandFailed("load-buffer failed".to_string()));
        }

        let output = self.run(&["paste-buffer", "-p", "-d", "-t", session]).await?;
        if !output.status.success() {
            return Err(DriverError::SessionNotFound(session.to_string()));
        }
        Ok(())
    }

    async fn capture(&self, session: &str) -> Result<String, DriverError> {
        let output = self.run(&["capture-pane", "-p", "-t", session]).await?;
        if !output.status.success() {
            return Err(DriverError::SessionNotFound(session.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn capture_history(&self, session: &str, lines: u32) -> Result<String, DriverError> {
        let start = format!("-{}", lines);
        let output = self.run(&["capture-pane", "-p", "-S", &start, "-t", session]).await?;
        if !output.status.success() {
            return Err(DriverError::SessionNotFound(session.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn resize(&self, session: &str, cols: u16, rows: u16) -> Result<(), DriverError> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        let output = self
            .run(&["resize-window", "-t", session, "-x", &cols, "-y", &rows])
            .await?;
        if !output.status.success() {
            // Older tmux lacks resize-window; not fatal for supervision
            warn!(session, "TmuxDriver::resize: resize-window failed");
        }
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<(), DriverError> {
        let output = self.run(&["kill-session", "-t", session]).await?;
        if !output.status.success() {
            let stderr = Self::stderr_of(&output);
            if stderr.contains("no server") || stderr.contains("session not found") || stderr.contains("can't find") {
                debug!(session, "TmuxDriver::kill_session: already gone");
                return Err(DriverError::SessionNotFound(session.to_string()));
            }
            return Err(DriverError::CommandFailed(stderr));
        }
        Ok(())
    }

    async fn session_exists(&self, session: &str) -> bool {
        match self.run(&["has-session", "-t", session]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}
