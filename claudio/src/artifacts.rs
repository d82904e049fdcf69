//! Workflow artifacts - well-known files agents use to hand decisions back
//!
//! Planner, evaluator, reviewer, and judge instances communicate through
//! YAML files at fixed paths inside their worktree. Pollers stat and parse
//! asynchronously; a file that does not exist yet is simply not ready, while
//! a malformed file is a per-stage failure the workflow records.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::plan::PlanSpec;

/// Directory inside a worktree that holds all artifact files
pub const ARTIFACT_DIR: &str = ".claudio";

/// Planner output: the plan itself
pub fn plan_path(worktree: &Path) -> PathBuf {
    worktree.join(ARTIFACT_DIR).join("plan.yaml")
}

/// Synthesis output: the review report
pub fn review_path(worktree: &Path) -> PathBuf {
    worktree.join(ARTIFACT_DIR).join("review.yaml")
}

/// Triple-shot judge output
pub fn triple_shot_result_path(worktree: &Path) -> PathBuf {
    worktree.join(ARTIFACT_DIR).join("triple-shot").join("result.yaml")
}

/// Adversarial critic output for one round
pub fn critique_path(worktree: &Path, round: u32) -> PathBuf {
    worktree
        .join(ARTIFACT_DIR)
        .join("adversarial")
        .join(format!("round-{}", round))
        .join("critique.yaml")
}

/// Error types for artifact polling
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// File missing or empty; poll again later
    #[error("Artifact not ready")]
    NotReady,

    #[error("Failed to parse artifact: {0}")]
    Parse(String),

    #[error("Artifact invalid: {0}")]
    Invalid(String),
}

/// Which artifact a poll is after
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactStage {
    /// A planner's plan
    Plan,
    /// The plan-manager's selection decision
    Decision,
    /// The synthesis reviewer's report
    Review,
    /// The triple-shot judge's verdict
    TripleShotVerdict,
    /// An adversarial critic's critique (index = round)
    Critique,
}

/// Plan-manager decision: select one candidate or merge them into a new plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Select,
    #[default]
    Merge,
}

/// Parsed `.claudio/plan.yaml` from the plan-manager's worktree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDecision {
    #[serde(default)]
    pub action: DecisionAction,

    /// Candidate index when `action` is `select`
    #[serde(default)]
    pub selected: Option<usize>,

    #[serde(flatten)]
    pub plan: PlanSpec,
}

/// One issue raised by the synthesis reviewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewIssue {
    /// Task the issue belongs to
    pub task_id: String,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

/// Parsed `.claudio/review.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

/// Parsed `.claudio/triple-shot/result.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleShotVerdict {
    /// Winning attempt instance id
    pub winner: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Critic verdict for an adversarial round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CritiqueVerdict {
    Approve,
    Revise,
}

/// Parsed `.claudio/adversarial/round-N/critique.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub verdict: CritiqueVerdict,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// A successfully parsed artifact
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactPayload {
    Plan(PlanSpec),
    Decision(PlanDecision),
    Review(ReviewReport),
    TripleShotVerdict(TripleShotVerdict),
    Critique(Critique),
}

/// One poll a coordinator is waiting on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRequest {
    pub stage: ArtifactStage,
    /// Planner index, round number, or 0 for singleton stages
    pub index: usize,
    pub worktree: PathBuf,
}

async fn read_ready(path: &Path) -> Result<String, ArtifactError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Err(ArtifactError::NotReady),
        Ok(content) => Ok(content),
        Err(_) => Err(ArtifactError::NotReady),
    }
}

/// Stat + parse one artifact
pub async fn poll(request: &ArtifactRequest) -> Result<ArtifactPayload, ArtifactError> {
    debug!(?request.stage, index = request.index, "artifact poll");
    match request.stage {
        ArtifactStage::Plan => {
            let content = read_ready(&plan_path(&request.worktree)).await?;
            let plan = PlanSpec::from_yaml(&content).map_err(|e| ArtifactError::Parse(e.to_string()))?;
            Ok(ArtifactPayload::Plan(plan))
        }
        ArtifactStage::Decision => {
            let content = read_ready(&plan_path(&request.worktree)).await?;
            let decision: PlanDecision =
                serde_yaml::from_str(&content).map_err(|e| ArtifactError::Parse(e.to_string()))?;
            // A merge decision must itself carry a valid plan
            if decision.action == DecisionAction::Merge {
                decision.plan.validate().map_err(|e| ArtifactError::Invalid(e.to_string()))?;
            }
            Ok(ArtifactPayload::Decision(decision))
        }
        ArtifactStage::Review => {
            let content = read_ready(&review_path(&request.worktree)).await?;
            let review: ReviewReport =
                serde_yaml::from_str(&content).map_err(|e| ArtifactError::Parse(e.to_string()))?;
            Ok(ArtifactPayload::Review(review))
        }
        ArtifactStage::TripleShotVerdict => {
            let content = read_ready(&triple_shot_result_path(&request.worktree)).await?;
            let verdict: TripleShotVerdict =
                serde_yaml::from_str(&content).map_err(|e| ArtifactError::Parse(e.to_string()))?;
            if verdict.winner.trim().is_empty() {
                return Err(ArtifactError::Invalid("verdict names no winner".to_string()));
            }
            Ok(ArtifactPayload::TripleShotVerdict(verdict))
        }
        ArtifactStage::Critique => {
            let content = read_ready(&critique_path(&request.worktree, request.index as u32)).await?;
            let critique: Critique = serde_yaml::from_str(&content).map_err(|e| ArtifactError::Parse(e.to_string()))?;
            Ok(ArtifactPayload::Critique(critique))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(stage: ArtifactStage, index: usize, worktree: &Path) -> ArtifactRequest {
        ArtifactRequest {
            stage,
            index,
            worktree: worktree.to_path_buf(),
        }
    }

    async fn write(path: PathBuf, content: &str) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_not_ready() {
        let dir = tempdir().unwrap();
        let result = poll(&request(ArtifactStage::Plan, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::NotReady)));
    }

    #[tokio::test]
    async fn test_empty_file_is_not_ready() {
        let dir = tempdir().unwrap();
        write(plan_path(dir.path()), "  \n").await;
        let result = poll(&request(ArtifactStage::Plan, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::NotReady)));
    }

    #[tokio::test]
    async fn test_plan_parses() {
        let dir = tempdir().unwrap();
        write(
            plan_path(dir.path()),
            "objective: Do it\ntasks:\n  - id: t1\n    title: First\n",
        )
        .await;
        let payload = poll(&request(ArtifactStage::Plan, 0, dir.path())).await.unwrap();
        match payload {
            ArtifactPayload::Plan(plan) => assert_eq!(plan.tasks[0].id, "t1"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_plan_is_parse_failure() {
        let dir = tempdir().unwrap();
        write(
            plan_path(dir.path()),
            "objective: broken\ntasks:\n  - id: t1\n    title: One\n    depends_on: [ghost]\n",
        )
        .await;
        let result = poll(&request(ArtifactStage::Plan, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::Parse(_))));
    }

    #[tokio::test]
    async fn test_decision_select() {
        let dir = tempdir().unwrap();
        write(
            plan_path(dir.path()),
            "action: select\nselected: 1\nobjective: pick\ntasks: []\n",
        )
        .await;
        let payload = poll(&request(ArtifactStage::Decision, 0, dir.path())).await.unwrap();
        match payload {
            ArtifactPayload::Decision(d) => {
                assert_eq!(d.action, DecisionAction::Select);
                assert_eq!(d.selected, Some(1));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decision_merge_requires_valid_plan() {
        let dir = tempdir().unwrap();
        write(plan_path(dir.path()), "action: merge\nobjective: merged\ntasks: []\n").await;
        let result = poll(&request(ArtifactStage::Decision, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_review_parses() {
        let dir = tempdir().unwrap();
        write(
            review_path(dir.path()),
            "approved: false\nissues:\n  - task_id: t1\n    summary: Missing tests\n",
        )
        .await;
        let payload = poll(&request(ArtifactStage::Review, 0, dir.path())).await.unwrap();
        match payload {
            ArtifactPayload::Review(r) => {
                assert!(!r.approved);
                assert_eq!(r.issues[0].task_id, "t1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_triple_shot_verdict() {
        let dir = tempdir().unwrap();
        write(
            triple_shot_result_path(dir.path()),
            "winner: attempt-2\nreasoning: cleanest diff\n",
        )
        .await;
        let payload = poll(&request(ArtifactStage::TripleShotVerdict, 0, dir.path()))
            .await
            .unwrap();
        match payload {
            ArtifactPayload::TripleShotVerdict(v) => assert_eq!(v.winner, "attempt-2"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_winner_invalid() {
        let dir = tempdir().unwrap();
        write(triple_shot_result_path(dir.path()), "winner: \"\"\n").await;
        let result = poll(&request(ArtifactStage::TripleShotVerdict, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_critique_round_path() {
        let dir = tempdir().unwrap();
        write(
            critique_path(dir.path(), 2),
            "verdict: revise\nissues:\n  - missing edge case\n",
        )
        .await;
        let payload = poll(&request(ArtifactStage::Critique, 2, dir.path())).await.unwrap();
        match payload {
            ArtifactPayload::Critique(c) => {
                assert_eq!(c.verdict, CritiqueVerdict::Revise);
                assert_eq!(c.issues.len(), 1);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_yaml_is_parse_error() {
        let dir = tempdir().unwrap();
        write(review_path(dir.path()), "approved: [not a bool\n").await;
        let result = poll(&request(ArtifactStage::Review, 0, dir.path())).await;
        assert!(matches!(result, Err(ArtifactError::Parse(_))));
    }
}
