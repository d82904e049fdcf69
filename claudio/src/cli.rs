//! CLI command definitions and shared paths

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

/// Claudio - console for supervising fleets of AI coding agents
#[derive(Parser)]
#[command(
    name = "claudio",
    about = "Supervise fleets of AI coding agents running in tmux worktrees",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Base repository (defaults to the current directory)
    #[arg(short, long)]
    pub repo: Option<PathBuf>,

    /// Session snapshot path (defaults to the per-repo session file)
    #[arg(long = "session-file")]
    pub session_file: Option<PathBuf>,

    /// Subcommand to execute; none launches the console
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the persisted session without launching the console
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Check the environment (git repo, tmux, gh) and exit
    Doctor,

    /// Show console logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

/// Output format for machine-readable commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Data directory for logs and session snapshots
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claudio")
}

/// Log file path
pub fn log_path() -> PathBuf {
    data_dir().join("logs").join("claudio.log")
}

/// Default session file for a repository
///
/// One session per repository, keyed by the repo directory name.
pub fn default_session_path(repo: &Path) -> PathBuf {
    let name = repo
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string());
    data_dir().join("sessions").join(format!("{}.json", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_session_path_uses_repo_name() {
        let path = default_session_path(Path::new("/home/dev/myrepo"));
        assert!(path.to_string_lossy().ends_with("sessions/myrepo.json"));
    }

    #[test]
    fn test_no_subcommand_is_console() {
        let cli = Cli::parse_from(["claudio"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_status_subcommand() {
        let cli = Cli::parse_from(["claudio", "status", "--format", "json"]);
        match cli.command {
            Some(Command::Status { format }) => assert_eq!(format, OutputFormat::Json),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
