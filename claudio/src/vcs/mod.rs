//! Git backend - worktrees, branches, merges, pushes, and PRs
//!
//! All source-control work goes through subprocess `git` (and `gh` for pull
//! requests). Repository-level operations are serialized by callers; worktree
//! operations touch only the worktree they are given.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepo(String),

    #[error("Failed to create worktree: {0}")]
    WorktreeCreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    WorktreeRemoveFailed(String),

    #[error("Branch operation failed: {0}")]
    BranchFailed(String),

    #[error("Push failed: {0}")]
    PushFailed(String),

    #[error("PR creation failed: {0}")]
    PrFailed(String),

    #[error("Git command failed: {0}")]
    CommandFailed(String),
}

/// Outcome of a merge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge committed cleanly
    Success,
    /// Merge hit conflicts; the merge was aborted and the conflicted
    /// paths are listed
    Conflict { files: Vec<String> },
}

/// Subprocess git backend rooted at one repository
#[derive(Debug, Clone)]
pub struct GitBackend {
    repo_root: PathBuf,
}

impl GitBackend {
    /// Create a backend for the repository at `repo_root`
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// The repository root this backend operates on
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output, GitError> {
        debug!(?cwd, ?args, "GitBackend::git");
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| GitError::CommandFailed(e.to_string()))
    }

    fn stderr_of(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }

    fn stdout_of(output: &std::process::Output) -> String {
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    /// Whether the root is a git repository
    pub async fn is_repo(&self) -> bool {
        match self.git(&self.repo_root, &["rev-parse", "--git-dir"]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    /// Create a worktree at `path` on a new branch off `base`
    pub async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GitError::WorktreeCreateFailed(format!("Failed to create base dir: {}", e)))?;
        }

        let path_str = path.display().to_string();
        let output = self
            .git(&self.repo_root, &["worktree", "add", &path_str, "-b", branch, base])
            .await?;

        if !output.status.success() {
            return Err(GitError::WorktreeCreateFailed(Self::stderr_of(&output)));
        }
        info!("Created worktree at {:?} on branch {}", path, branch);
        Ok(())
    }

    /// Create a worktree at `path` checked out on an existing branch
    pub async fn create_worktree_from_branch(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GitError::WorktreeCreateFailed(format!("Failed to create base dir: {}", e)))?;
        }

        let path_str = path.display().to_string();
        let output = self.git(&self.repo_root, &["worktree", "add", &path_str, branch]).await?;

        if !output.status.success() {
            return Err(GitError::WorktreeCreateFailed(Self::stderr_of(&output)));
        }
        info!("Created worktree at {:?} from branch {}", path, branch);
        Ok(())
    }

    /// Remove a worktree; `force` discards uncommitted changes
    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        if !path.exists() {
            warn!("Worktree {:?} does not exist, skipping removal", path);
            return Ok(());
        }

        let path_str = path.display().to_string();
        let mut args = vec!["worktree", "remove", path_str.as_str()];
        if force {
            args.push("--force");
        }

        let output = self.git(&self.repo_root, &args).await?;
        if !output.status.success() {
            let stderr = Self::stderr_of(&output);
            if !stderr.contains("is not a working tree") {
                return Err(GitError::WorktreeRemoveFailed(stderr));
            }
        }
        info!("Removed worktree {:?}", path);
        Ok(())
    }

    /// Delete a local branch (best effort)
    pub async fn delete_branch(&self, branch: &str) {
        let _ = self.git(&self.repo_root, &["branch", "-D", branch]).await;
        debug!(%branch, "GitBackend::delete_branch: attempted");
    }

    /// List local branch names
    pub async fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let output = self
            .git(
                &self.repo_root,
                &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            )
            .await?;
        if !output.status.success() {
            return Err(GitError::BranchFailed(Self::stderr_of(&output)));
        }
        Ok(Self::stdout_of(&output)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Determine the main branch
    ///
    /// Uses origin's HEAD when available, otherwise falls back to a local
    /// `main` then `master`.
    pub async fn main_branch(&self) -> Result<String, GitError> {
        let output = self
            .git(&self.repo_root, &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"])
            .await?;
        if output.status.success() {
            let name = Self::stdout_of(&output).trim().to_string();
            if let Some(short) = name.strip_prefix("origin/") {
                return Ok(short.to_string());
            }
        }

        for candidate in ["main", "master"] {
            let probe = format!("refs/heads/{}", candidate);
            let output = self
                .git(&self.repo_root, &["show-ref", "--verify", "--quiet", &probe])
                .await?;
            if output.status.success() {
                return Ok(candidate.to_string());
            }
        }
        Err(GitError::BranchFailed("No main or master branch found".to_string()))
    }

    /// Create a branch at `base` without checking it out
    pub async fn create_branch(&self, name: &str, base: &str) -> Result<(), GitError> {
        let output = self.git(&self.repo_root, &["branch", name, base]).await?;
        if !output.status.success() {
            return Err(GitError::BranchFailed(Self::stderr_of(&output)));
        }
        Ok(())
    }

    /// Paths modified (staged, unstaged, or untracked) in a worktree
    pub async fn modified_files(&self, worktree: &Path) -> Result<Vec<String>, GitError> {
        let output = self.git(worktree, &["status", "--porcelain"]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        Ok(Self::stdout_of(&output)
            .lines()
            .filter_map(|line| {
                // Porcelain format: XY <path> (or "XY from -> to" for renames)
                let path = line.get(3..)?;
                let path = path.rsplit(" -> ").next().unwrap_or(path);
                Some(path.trim().to_string())
            })
            .filter(|p| !p.is_empty())
            .collect())
    }

    /// Stage and commit everything in a worktree
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GitError> {
        let status = self.git(worktree, &["status", "--porcelain"]).await?;
        if status.stdout.is_empty() {
            debug!(?worktree, "GitBackend::commit_all: nothing to commit");
            return Ok(());
        }

        let output = self.git(worktree, &["add", "-A"]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        let output = self.git(worktree, &["commit", "-m", message]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        Ok(())
    }

    /// Count commits on `branch` not reachable from `base`
    ///
    /// This is the verified-commit figure workflows gate task completion on.
    pub async fn commits_ahead(&self, branch: &str, base: &str) -> Result<u32, GitError> {
        let range = format!("{}..{}", base, branch);
        let output = self.git(&self.repo_root, &["rev-list", "--count", &range]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        Self::stdout_of(&output)
            .trim()
            .parse()
            .map_err(|e| GitError::CommandFailed(format!("Bad rev-list output: {}", e)))
    }

    /// Merge `branch` into the branch checked out at `worktree`
    ///
    /// On conflict the merge is aborted and the conflicted files reported.
    pub async fn merge_branch(&self, worktree: &Path, branch: &str, message: &str) -> Result<MergeOutcome, GitError> {
        let output = self.git(worktree, &["merge", "--no-ff", "-m", message, branch]).await?;

        if output.status.success() {
            debug!(?worktree, %branch, "GitBackend::merge_branch: clean merge");
            return Ok(MergeOutcome::Success);
        }

        // Collect conflicted paths before aborting
        let conflicts = self
            .git(worktree, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        let files: Vec<String> = Self::stdout_of(&conflicts)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if files.is_empty() {
            // Not a content conflict; surface the raw failure
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }

        let _ = self.git(worktree, &["merge", "--abort"]).await;
        warn!(?worktree, %branch, ?files, "GitBackend::merge_branch: conflict");
        Ok(MergeOutcome::Conflict { files })
    }

    /// Push a branch to origin
    pub async fn push(&self, branch: &str) -> Result<(), GitError> {
        let output = self.git(&self.repo_root, &["push", "-u", "origin", branch]).await?;
        if !output.status.success() {
            return Err(GitError::PushFailed(Self::stderr_of(&output)));
        }
        info!("Pushed branch {}", branch);
        Ok(())
    }

    /// Fetch origin and rebase the worktree's branch onto `onto`
    pub async fn fetch_rebase(&self, worktree: &Path, onto: &str) -> Result<(), GitError> {
        let output = self.git(worktree, &["fetch", "origin"]).await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        let output = self.git(worktree, &["rebase", onto]).await?;
        if !output.status.success() {
            let _ = self.git(worktree, &["rebase", "--abort"]).await;
            return Err(GitError::CommandFailed(Self::stderr_of(&output)));
        }
        Ok(())
    }

    /// Open a pull request for `branch` via `gh`; returns the PR URL
    pub async fn open_pr(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        labels: &[String],
        draft: bool,
    ) -> Result<String, GitError> {
        let mut args = vec![
            "pr".to_string(),
            "create".to_string(),
            "--head".to_string(),
            branch.to_string(),
            "--title".to_string(),
            title.to_string(),
            "--body".to_string(),
            body.to_string(),
        ];
        for label in labels {
            args.push("--label".to_string());
            args.push(label.clone());
        }
        if draft {
            args.push("--draft".to_string());
        }

        let output = Command::new("gh")
            .args(&args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| GitError::PrFailed(format!("gh not available: {}", e)))?;

        if !output.status.success() {
            return Err(GitError::PrFailed(Self::stderr_of(&output)));
        }

        let url = Self::stdout_of(&output).trim().to_string();
        info!("Opened PR for {}: {}", branch, url);
        Ok(url)
    }
}
