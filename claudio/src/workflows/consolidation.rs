//! Consolidation - merging completed task branches into per-group PRs
//!
//! A sub-machine of the ultra-plan coordinator. The coordinator owns the
//! state and decides the next step; the app loop executes each step against
//! git on a background task and feeds the outcome back. Merge conflicts
//! pause the machine until the user resolves them and resumes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vcs::{GitBackend, MergeOutcome};

/// Consolidation sub-phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationPhase {
    #[default]
    Idle,
    DetectingConflicts,
    CreatingBranches,
    MergingTasks,
    Pushing,
    CreatingPrs,
    /// Merge conflict awaiting manual resolution
    Paused,
    Complete,
    Failed,
}

/// One consolidation group: a branch collecting a set of task branches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationGroup {
    pub name: String,
    pub branch: String,
    /// Task ids merged into this group, in dependency order
    pub task_ids: Vec<String>,
    /// Task branches, aligned with `task_ids`
    pub task_branches: Vec<String>,
    /// How many task branches have merged so far
    pub merged: usize,
    pub pr_url: Option<String>,
    /// Scratch worktree the merges happen in
    pub worktree: PathBuf,
}

/// Consolidation machine state, persisted with the ultra-plan session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationState {
    pub phase: ConsolidationPhase,
    pub groups: Vec<ConsolidationGroup>,
    pub current_group: usize,
    /// Files conflicting while Paused
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

impl ConsolidationState {
    pub fn current(&self) -> Option<&ConsolidationGroup> {
        self.groups.get(self.current_group)
    }

    /// The next step to execute, if the machine is in a running phase
    pub fn next_step(&self, base_branch: &str) -> Option<ConsolidationStep> {
        let group = self.current()?;
        match self.phase {
            ConsolidationPhase::CreatingBranches => Some(ConsolidationStep::CreateBranch {
                group_index: self.current_group,
                branch: group.branch.clone(),
                base: base_branch.to_string(),
                worktree: group.worktree.clone(),
            }),
            ConsolidationPhase::MergingTasks => {
                let task_branch = group.task_branches.get(group.merged)?.clone();
                Some(ConsolidationStep::MergeTask {
                    group_index: self.current_group,
                    task_branch,
                    worktree: group.worktree.clone(),
                })
            }
            ConsolidationPhase::Pushing => Some(ConsolidationStep::Push {
                group_index: self.current_group,
                branch: group.branch.clone(),
            }),
            ConsolidationPhase::CreatingPrs => Some(ConsolidationStep::OpenPr {
                group_index: self.current_group,
                branch: group.branch.clone(),
                title: format!("claudio: {}", group.name),
                body: format!("Consolidated tasks: {}", group.task_ids.join(", ")),
            }),
            _ => None,
        }
    }

    /// Advance the machine on a step outcome; returns true if the whole
    /// consolidation just completed
    pub fn apply(&mut self, outcome: &ConsolidationOutcome) -> bool {
        debug!(?outcome, phase = ?self.phase, "ConsolidationState::apply");
        match outcome {
            ConsolidationOutcome::BranchCreated { .. } => {
                self.phase = ConsolidationPhase::MergingTasks;
            }
            ConsolidationOutcome::Merged { .. } => {
                if let Some(group) = self.groups.get_mut(self.current_group) {
                    group.merged += 1;
                    if group.merged >= group.task_branches.len() {
                        self.phase = ConsolidationPhase::Pushing;
                    }
                }
            }
            ConsolidationOutcome::MergeConflict { files, .. } => {
                self.conflict_files = files.clone();
                self.phase = ConsolidationPhase::Paused;
            }
            ConsolidationOutcome::Pushed { .. } => {
                self.phase = ConsolidationPhase::CreatingPrs;
            }
            ConsolidationOutcome::PrOpened { url, .. } => {
                if let Some(group) = self.groups.get_mut(self.current_group) {
                    group.pr_url = Some(url.clone());
                }
                if self.current_group + 1 < self.groups.len() {
                    self.current_group += 1;
                    self.phase = ConsolidationPhase::CreatingBranches;
                } else {
                    self.phase = ConsolidationPhase::Complete;
                    return true;
                }
            }
            ConsolidationOutcome::StepFailed { error, .. } => {
                self.error = Some(error.clone());
                self.phase = ConsolidationPhase::Failed;
            }
        }
        false
    }

    /// Resume after the user resolved a merge conflict in the group worktree
    ///
    /// Re-enters MergingTasks; the conflicted merge is retried (a manual
    /// resolution that already committed the merge makes the retry a no-op).
    pub fn resume(&mut self) -> bool {
        if self.phase != ConsolidationPhase::Paused {
            return false;
        }
        self.conflict_files.clear();
        self.phase = ConsolidationPhase::MergingTasks;
        true
    }
}

/// One git operation dispatched to a background task
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationStep {
    CreateBranch {
        group_index: usize,
        branch: String,
        base: String,
        worktree: PathBuf,
    },
    MergeTask {
        group_index: usize,
        task_branch: String,
        worktree: PathBuf,
    },
    Push {
        group_index: usize,
        branch: String,
    },
    OpenPr {
        group_index: usize,
        branch: String,
        title: String,
        body: String,
    },
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationOutcome {
    BranchCreated { group_index: usize },
    Merged { group_index: usize },
    MergeConflict { group_index: usize, files: Vec<String> },
    Pushed { group_index: usize },
    PrOpened { group_index: usize, url: String },
    StepFailed { group_index: usize, error: String },
}

/// Execute one consolidation step against git
pub async fn run_consolidation_step(git: &GitBackend, step: ConsolidationStep) -> ConsolidationOutcome {
    match step {
        ConsolidationStep::CreateBranch {
            group_index,
            branch,
            base,
            worktree,
        } => {
            if let Err(e) = git.create_branch(&branch, &base).await {
                return ConsolidationOutcome::StepFailed {
                    group_index,
                    error: e.to_string(),
                };
            }
            match git.create_worktree_from_branch(&worktree, &branch).await {
                Ok(()) => ConsolidationOutcome::BranchCreated { group_index },
                Err(e) => ConsolidationOutcome::StepFailed {
                    group_index,
                    error: e.to_string(),
                },
            }
        }
        ConsolidationStep::MergeTask {
            group_index,
            task_branch,
            worktree,
        } => {
            let message = format!("Merge {}", task_branch);
            match git.merge_branch(&worktree, &task_branch, &message).await {
                Ok(MergeOutcome::Success) => ConsolidationOutcome::Merged { group_index },
                Ok(MergeOutcome::Conflict { files }) => ConsolidationOutcome::MergeConflict { group_index, files },
                Err(e) => ConsolidationOutcome::StepFailed {
                    group_index,
                    error: e.to_string(),
                },
            }
        }
        ConsolidationStep::Push { group_index, branch } => match git.push(&branch).await {
            Ok(()) => ConsolidationOutcome::Pushed { group_index },
            Err(e) => ConsolidationOutcome::StepFailed {
                group_index,
                error: e.to_string(),
            },
        },
        ConsolidationStep::OpenPr {
            group_index,
            branch,
            title,
            body,
        } => match git.open_pr(&branch, &title, &body, &["claudio".to_string()], false).await {
            Ok(url) => ConsolidationOutcome::PrOpened { group_index, url },
            Err(e) => ConsolidationOutcome::StepFailed {
                group_index,
                error: e.to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_groups(n: usize, tasks_per_group: usize) -> ConsolidationState {
        ConsolidationState {
            phase: ConsolidationPhase::CreatingBranches,
            groups: (0..n)
                .map(|g| ConsolidationGroup {
                    name: format!("group-{}", g + 1),
                    branch: format!("claudio/group-{}", g + 1),
                    task_ids: (0..tasks_per_group).map(|t| format!("t{}-{}", g, t)).collect(),
                    task_branches: (0..tasks_per_group).map(|t| format!("claudio/t{}-{}", g, t)).collect(),
                    merged: 0,
                    pr_url: None,
                    worktree: PathBuf::from(format!("/tmp/consolidate-{}", g)),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_step_sequence_single_group() {
        let mut state = state_with_groups(1, 2);

        match state.next_step("main").unwrap() {
            ConsolidationStep::CreateBranch { base, .. } => assert_eq!(base, "main"),
            other => panic!("unexpected step {:?}", other),
        }
        state.apply(&ConsolidationOutcome::BranchCreated { group_index: 0 });
        assert_eq!(state.phase, ConsolidationPhase::MergingTasks);

        // Two merges, then push, then PR
        for expected_branch in ["claudio/t0-0", "claudio/t0-1"] {
            match state.next_step("main").unwrap() {
                ConsolidationStep::MergeTask { task_branch, .. } => assert_eq!(task_branch, expected_branch),
                other => panic!("unexpected step {:?}", other),
            }
            state.apply(&ConsolidationOutcome::Merged { group_index: 0 });
        }
        assert_eq!(state.phase, ConsolidationPhase::Pushing);
        state.apply(&ConsolidationOutcome::Pushed { group_index: 0 });
        assert_eq!(state.phase, ConsolidationPhase::CreatingPrs);

        let done = state.apply(&ConsolidationOutcome::PrOpened {
            group_index: 0,
            url: "https://example.com/pr/1".to_string(),
        });
        assert!(done);
        assert_eq!(state.phase, ConsolidationPhase::Complete);
        assert_eq!(state.groups[0].pr_url.as_deref(), Some("https://example.com/pr/1"));
    }

    #[test]
    fn test_conflict_pauses_and_resume_retries_same_merge() {
        let mut state = state_with_groups(1, 2);
        state.apply(&ConsolidationOutcome::BranchCreated { group_index: 0 });
        state.apply(&ConsolidationOutcome::Merged { group_index: 0 });

        state.apply(&ConsolidationOutcome::MergeConflict {
            group_index: 0,
            files: vec!["src/foo.rs".to_string()],
        });
        assert_eq!(state.phase, ConsolidationPhase::Paused);
        assert_eq!(state.conflict_files, vec!["src/foo.rs"]);
        // No step while paused
        assert!(state.next_step("main").is_none());

        assert!(state.resume());
        assert_eq!(state.phase, ConsolidationPhase::MergingTasks);
        assert!(state.conflict_files.is_empty());
        // Retries the same (second) task branch
        match state.next_step("main").unwrap() {
            ConsolidationStep::MergeTask { task_branch, .. } => assert_eq!(task_branch, "claudio/t0-1"),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_resume_only_from_paused() {
        let mut state = state_with_groups(1, 1);
        assert!(!state.resume());
    }

    #[test]
    fn test_multiple_groups_advance() {
        let mut state = state_with_groups(2, 1);
        state.apply(&ConsolidationOutcome::BranchCreated { group_index: 0 });
        state.apply(&ConsolidationOutcome::Merged { group_index: 0 });
        state.apply(&ConsolidationOutcome::Pushed { group_index: 0 });
        let done = state.apply(&ConsolidationOutcome::PrOpened {
            group_index: 0,
            url: "u1".to_string(),
        });
        assert!(!done);
        assert_eq!(state.current_group, 1);
        assert_eq!(state.phase, ConsolidationPhase::CreatingBranches);

        state.apply(&ConsolidationOutcome::BranchCreated { group_index: 1 });
        state.apply(&ConsolidationOutcome::Merged { group_index: 1 });
        state.apply(&ConsolidationOutcome::Pushed { group_index: 1 });
        let done = state.apply(&ConsolidationOutcome::PrOpened {
            group_index: 1,
            url: "u2".to_string(),
        });
        assert!(done);
    }

    #[test]
    fn test_step_failure_is_terminal() {
        let mut state = state_with_groups(1, 1);
        state.apply(&ConsolidationOutcome::StepFailed {
            group_index: 0,
            error: "push rejected".to_string(),
        });
        assert_eq!(state.phase, ConsolidationPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("push rejected"));
        assert!(state.next_step("main").is_none());
    }
}
