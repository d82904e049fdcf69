//! Command layer - pure `(view, input) -> result`
//!
//! Commands never touch the model; they return a [`CommandResult`] whose
//! populated fields the model applies one by one. This keeps the parser
//! unit-testable without a live orchestrator.

use std::path::PathBuf;

use super::model::{Mode, ModelView};
use crate::workflows::GroupDecisionChoice;

/// Ultra-plan launch parameters parsed from `:up`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UltraPlanRequest {
    pub objective: String,
    pub multi_pass: bool,
    /// Pre-written plan file (skips the planning phase)
    pub plan_file: Option<PathBuf>,
}

/// Result of executing a command
///
/// Presence of a field means "apply this mutation"; absence leaves the
/// model unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub info: Option<String>,
    pub error: Option<String>,
    pub toggle_help: Option<bool>,
    pub toggle_stats: Option<bool>,
    pub toggle_diff: Option<bool>,
    pub toggle_conflicts: Option<bool>,
    pub enter_mode: Option<Mode>,
    pub tab_delta: Option<i32>,
    pub ensure_active_visible: bool,
    pub quit: bool,
    pub start_triple_shot: Option<String>,
    pub start_adversarial: Option<String>,
    pub start_plan: Option<String>,
    pub start_multi_plan: Option<String>,
    pub start_ultra_plan: Option<UltraPlanRequest>,
    pub resume_consolidation: bool,
    pub approve: bool,
    pub group_decision: Option<GroupDecisionChoice>,
    pub list_branches: bool,
    pub new_task: Option<String>,
}

impl CommandResult {
    fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Expand a leading `~` using HOME
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Execute a `:` command against a model view
pub fn execute(view: &ModelView, input: &str) -> CommandResult {
    let input = input.trim();
    let (name, rest) = match input.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (input, ""),
    };

    match name {
        "" => CommandResult::default(),

        "q" | "quit" => CommandResult {
            quit: true,
            ..Default::default()
        },

        "help" | "h" => CommandResult {
            toggle_help: Some(true),
            ..Default::default()
        },

        "stats" => CommandResult {
            toggle_stats: Some(true),
            ..Default::default()
        },

        "diff" => {
            if view.active_instance.is_none() {
                CommandResult::err("No active instance for diff")
            } else {
                CommandResult {
                    toggle_diff: Some(true),
                    ..Default::default()
                }
            }
        }

        "conflicts" => CommandResult {
            toggle_conflicts: Some(true),
            ..Default::default()
        },

        "branches" => CommandResult {
            list_branches: true,
            info: Some("Listing branches...".to_string()),
            ..Default::default()
        },

        "add" | "task" => {
            if rest.is_empty() {
                CommandResult {
                    enter_mode: Some(Mode::TaskInput),
                    ..Default::default()
                }
            } else {
                // Direct form bypasses the input overlay
                CommandResult {
                    info: Some(format!("Adding task: {}", truncate(rest, 60))),
                    new_task: Some(rest.to_string()),
                    ..Default::default()
                }
            }
        }

        "ts" | "tripleshot" => {
            if rest.is_empty() {
                CommandResult::err("Usage: :ts <task>")
            } else {
                CommandResult {
                    start_triple_shot: Some(rest.to_string()),
                    ..Default::default()
                }
            }
        }

        "adv" | "adversarial" => {
            if rest.is_empty() {
                CommandResult::err("Usage: :adv <task>")
            } else {
                CommandResult {
                    start_adversarial: Some(rest.to_string()),
                    ..Default::default()
                }
            }
        }

        "plan" => {
            if rest.is_empty() {
                CommandResult::err("Usage: :plan <objective>")
            } else {
                CommandResult {
                    start_plan: Some(rest.to_string()),
                    ..Default::default()
                }
            }
        }

        "mp" | "multiplan" => {
            if rest.is_empty() {
                CommandResult::err("Usage: :mp <objective>")
            } else {
                CommandResult {
                    start_multi_plan: Some(rest.to_string()),
                    ..Default::default()
                }
            }
        }

        "up" | "ultraplan" => parse_ultra_plan(view, rest),

        "r" | "resume" => {
            if !view.has_ultra_plan {
                CommandResult::err("No ultra-plan session to resume")
            } else if !view.ultra_plan_paused {
                CommandResult::err("Consolidation is not paused")
            } else {
                CommandResult {
                    resume_consolidation: true,
                    info: Some("Resuming consolidation".to_string()),
                    ..Default::default()
                }
            }
        }

        "approve" | "y" => CommandResult {
            approve: true,
            ..Default::default()
        },

        "continue" => decision(view, GroupDecisionChoice::Continue),
        "retry" => decision(view, GroupDecisionChoice::Retry),
        "abort" => decision(view, GroupDecisionChoice::Cancel),

        other => CommandResult::err(format!("Unknown command: {}", other)),
    }
}

fn decision(view: &ModelView, choice: GroupDecisionChoice) -> CommandResult {
    if !view.has_ultra_plan {
        CommandResult::err("No ultra-plan session")
    } else {
        CommandResult {
            group_decision: Some(choice),
            ..Default::default()
        }
    }
}

fn parse_ultra_plan(_view: &ModelView, rest: &str) -> CommandResult {
    let mut multi_pass = false;
    let mut plan_file: Option<PathBuf> = None;
    let mut objective_parts: Vec<&str> = Vec::new();

    let mut tokens = rest.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        match token {
            "--multi-pass" | "-m" => multi_pass = true,
            "--file" | "-f" => match tokens.next() {
                Some(path) => plan_file = Some(expand_home(path)),
                None => return CommandResult::err("--file requires a path"),
            },
            other => objective_parts.push(other),
        }
    }

    let objective = objective_parts.join(" ");
    if objective.is_empty() && plan_file.is_none() {
        return CommandResult::err("Usage: :up [--multi-pass] [--file <plan.yaml>] <objective>");
    }

    CommandResult {
        start_ultra_plan: Some(UltraPlanRequest {
            objective,
            multi_pass,
            plan_file,
        }),
        ..Default::default()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ModelView {
        ModelView {
            instance_count: 1,
            active_instance: Some("i-1".to_string()),
            has_ultra_plan: false,
            ultra_plan_paused: false,
        }
    }

    #[test]
    fn test_quit() {
        let result = execute(&view(), "q");
        assert!(result.quit);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_unknown_command() {
        let result = execute(&view(), "frobnicate");
        assert!(result.error.unwrap().contains("Unknown command"));
    }

    #[test]
    fn test_empty_is_noop() {
        assert_eq!(execute(&view(), "  "), CommandResult::default());
    }

    #[test]
    fn test_triple_shot_requires_task() {
        assert!(execute(&view(), "ts").error.is_some());
        let result = execute(&view(), "ts refactor the parser");
        assert_eq!(result.start_triple_shot.as_deref(), Some("refactor the parser"));
    }

    #[test]
    fn test_ultra_plan_flags() {
        let result = execute(&view(), "up --multi-pass build a cache layer");
        let request = result.start_ultra_plan.unwrap();
        assert!(request.multi_pass);
        assert_eq!(request.objective, "build a cache layer");
        assert!(request.plan_file.is_none());
    }

    #[test]
    fn test_ultra_plan_file_flag() {
        let result = execute(&view(), "up --file /tmp/plan.yaml ship it");
        let request = result.start_ultra_plan.unwrap();
        assert_eq!(request.plan_file, Some(PathBuf::from("/tmp/plan.yaml")));
        assert_eq!(request.objective, "ship it");
    }

    #[test]
    fn test_ultra_plan_home_expansion() {
        let result = execute(&view(), "up --file ~/plans/p.yaml obj");
        let path = result.start_ultra_plan.unwrap().plan_file.unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.to_string_lossy().ends_with("plans/p.yaml"));
    }

    #[test]
    fn test_ultra_plan_missing_args() {
        assert!(execute(&view(), "up").error.is_some());
        assert!(execute(&view(), "up --file").error.is_some());
    }

    #[test]
    fn test_resume_requires_paused_ultra_plan() {
        assert!(execute(&view(), "r").error.is_some());

        let mut v = view();
        v.has_ultra_plan = true;
        assert!(execute(&v, "r").error.is_some());

        v.ultra_plan_paused = true;
        let result = execute(&v, "r");
        assert!(result.resume_consolidation);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_group_decisions_require_ultra_plan() {
        assert!(execute(&view(), "continue").error.is_some());
        let mut v = view();
        v.has_ultra_plan = true;
        assert_eq!(
            execute(&v, "retry").group_decision,
            Some(GroupDecisionChoice::Retry)
        );
    }

    #[test]
    fn test_diff_requires_active_instance() {
        let mut v = view();
        v.active_instance = None;
        assert!(execute(&v, "diff").error.is_some());
        assert_eq!(execute(&view(), "diff").toggle_diff, Some(true));
    }

    #[test]
    fn test_add_task_direct_form() {
        let result = execute(&view(), "add write integration tests");
        assert_eq!(result.new_task.as_deref(), Some("write integration tests"));

        // Bare :add opens the task-entry overlay instead
        let result = execute(&view(), "add");
        assert_eq!(result.enter_mode, Some(Mode::TaskInput));
        assert!(result.new_task.is_none());
    }
}
