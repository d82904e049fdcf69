//! Claudio - console entry point
//!
//! Exit codes: 0 normal, 1 initialization failure, 2 configuration error.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use claudio::cli::{Cli, Command, OutputFormat, default_session_path, log_path};
use claudio::config::Config;
use claudio::driver::TmuxDriverFactory;
use claudio::events::EventBus;
use claudio::session::{Session, SessionLock, load_session, save_session};
use claudio::ui::AppLoop;
use claudio::vcs::GitBackend;
use claudio::Orchestrator;

const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_file_path = log_path();
    if let Some(parent) = log_file_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    // Level priority: CLI --log-level > config file > INFO
    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            other => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // The terminal belongs to the TUI; logs go to a file only
    let log_file = fs::File::create(&log_file_path).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    if let Err(e) = setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()) {
        eprintln!("Failed to set up logging: {:#}", e);
        std::process::exit(EXIT_INIT_FAILURE);
    }

    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let repo = cli
        .repo
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let session_path = cli.session_file.clone().unwrap_or_else(|| default_session_path(&repo));

    debug!(?repo, ?session_path, command = ?cli.command.as_ref().map(|_| "sub"), "main: dispatching");
    let result = match cli.command {
        Some(Command::Status { format }) => cmd_status(&session_path, format),
        Some(Command::Doctor) => cmd_doctor(&repo).await,
        Some(Command::Logs { lines }) => cmd_logs(lines),
        None => cmd_console(config, repo, session_path).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(EXIT_INIT_FAILURE);
    }
}

/// Print the persisted session without launching anything
fn cmd_status(session_path: &std::path::Path, format: OutputFormat) -> Result<()> {
    if !session_path.exists() {
        println!("No session found at {}", session_path.display());
        return Ok(());
    }
    let session = load_session(session_path)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        OutputFormat::Text => {
            println!("Session: {} ({})", session.name, session.id);
            println!("Repo: {}", session.base_repo.display());
            println!("{:<12} {:<14} {}", "ID", "STATUS", "TASK");
            println!("{}", "-".repeat(70));
            for inst in &session.instances {
                println!("{:<12} {:<14} {}", inst.id, format!("{:?}", inst.status), inst.task);
            }
            let metrics = session.metrics();
            println!();
            println!(
                "{} instances: {} working, {} waiting, {} completed, {} failed",
                metrics.total, metrics.working, metrics.waiting, metrics.completed, metrics.failed
            );
        }
    }
    Ok(())
}

/// Environment checks: git repo, tmux, gh
async fn cmd_doctor(repo: &std::path::Path) -> Result<()> {
    let mut ok = true;

    let git = GitBackend::new(repo);
    if git.is_repo().await {
        println!("ok   git repository: {}", repo.display());
        match git.main_branch().await {
            Ok(branch) => println!("ok   main branch: {}", branch),
            Err(e) => {
                println!("FAIL main branch: {}", e);
                ok = false;
            }
        }
    } else {
        println!("FAIL not a git repository: {}", repo.display());
        ok = false;
    }

    for tool in ["tmux", "gh"] {
        let found = tokio::process::Command::new(tool)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if found {
            println!("ok   {} available", tool);
        } else if tool == "gh" {
            // PRs are the only feature that needs gh
            println!("warn {} not found (PR creation disabled)", tool);
        } else {
            println!("FAIL {} not found", tool);
            ok = false;
        }
    }

    if !ok {
        return Err(eyre::eyre!("environment checks failed"));
    }
    Ok(())
}

/// Print the tail of the log file
fn cmd_logs(lines: usize) -> Result<()> {
    let path = log_path();
    if !path.exists() {
        println!("No log file found at: {}", path.display());
        return Ok(());
    }
    let content = fs::read_to_string(&path).context("Failed to read log file")?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{}", line);
    }
    Ok(())
}

/// Launch the console
async fn cmd_console(config: Config, repo: PathBuf, session_path: PathBuf) -> Result<()> {
    debug!("cmd_console: called");

    // Startup validation - fail fast with clear messages
    let git = GitBackend::new(&repo);
    if !git.is_repo().await {
        return Err(eyre::eyre!(
            "Not a git repository: {}. Claudio supervises worktrees of one repo.",
            repo.display()
        ));
    }
    fs::create_dir_all(&config.git.worktree_dir).with_context(|| {
        format!("Cannot create worktree directory {}", config.git.worktree_dir.display())
    })?;
    info!("Startup validation passed");

    // One console per session file
    let lock = SessionLock::acquire(&session_path)?;

    // Load or create the session
    let session = if session_path.exists() {
        load_session(&session_path).context("Failed to load session")?
    } else {
        let name = repo
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        let session = Session::new(name, &repo);
        save_session(&session_path, &session).context("Failed to create session file")?;
        session
    };
    info!(instances = session.instances.len(), "Session ready");

    let bus = Arc::new(EventBus::new());
    let (orch_tx, orch_rx) = tokio::sync::mpsc::unbounded_channel();
    let orch = Orchestrator::new(
        session,
        git,
        Arc::new(TmuxDriverFactory),
        bus,
        config.clone(),
        orch_tx,
        Some(lock),
    )
    .await
    .context("Failed to initialize orchestrator")?;

    // Signals initiate graceful shutdown: quit the UI, persist, release the lock
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => warn!("SIGINT received"),
                _ = sigterm.recv() => warn!("SIGTERM received"),
                _ = sighup.recv() => warn!("SIGHUP received"),
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    let mut app = AppLoop::new(orch, config, session_path, orch_rx);
    app.run(&mut shutdown_rx).await
}
