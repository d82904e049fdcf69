//! Triple-shot - three parallel attempts, one judge
//!
//! All three attempts run the same task in separate worktrees. When all
//! three have terminated one way or another, a judge instance compares the
//! diffs and names a winner. An error in one attempt never cancels the
//! others. Multiple triple-shots run concurrently, keyed by group id.

use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::{ArtifactPayload, ArtifactRequest, ArtifactStage};
use crate::orchestrator::Orchestrator;
use crate::session::{InstanceStatus, SessionType};

use super::{Coordinator, HostCtx, WorkflowKey, build_judge_prompt};

/// Triple-shot phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripleShotPhase {
    #[default]
    Running,
    Judging,
    Complete,
    Failed,
}

/// Triple-shot configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TripleShotConfig {
    pub auto_approve: bool,
    /// Chain an adversarial session on the winner when done
    pub adversarial: bool,
}

/// Persistent state of one triple-shot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleShotSession {
    pub task: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub attempt_ids: Vec<String>,
    #[serde(default)]
    pub judge_id: Option<String>,
    #[serde(default)]
    pub winner_id: Option<String>,
    #[serde(default)]
    pub phase: TripleShotPhase,
    #[serde(default)]
    pub config: TripleShotConfig,
}

impl TripleShotSession {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            group_id: String::new(),
            attempt_ids: Vec::new(),
            judge_id: None,
            winner_id: None,
            phase: TripleShotPhase::Running,
            config: TripleShotConfig::default(),
        }
    }

    /// Every instance this session owns (legacy-migration helper)
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids = self.attempt_ids.clone();
        ids.extend(self.judge_id.clone());
        ids
    }
}

/// Coordinator for one triple-shot
#[derive(Debug)]
pub struct TripleShotCoordinator {
    pub state: TripleShotSession,
}

impl TripleShotCoordinator {
    /// Spawn the three attempts in a fresh group
    pub fn start(ctx: &mut HostCtx, task: &str, config: TripleShotConfig) -> Result<Self> {
        let mut state = TripleShotSession::new(task);
        state.config = config;
        state.group_id = ctx.create_group(
            &format!("triple-shot: {}", truncate(task, 40)),
            SessionType::TripleShot,
            task,
        );

        for _ in 0..3 {
            let id = ctx.spawn_instance(task, Some(state.group_id.as_str()))?;
            state.attempt_ids.push(id);
        }
        info!(group = %state.group_id, "triple-shot started");
        ctx.info("Triple-shot started: three attempts running");
        Ok(Self { state })
    }

    pub fn from_state(state: TripleShotSession) -> Self {
        Self { state }
    }

    /// Winner chaining flag for the app loop
    pub fn wants_adversarial_followup(&self) -> bool {
        self.state.phase == TripleShotPhase::Complete && self.state.config.adversarial && self.state.winner_id.is_some()
    }

    fn all_attempts_terminal(&self, ctx: &HostCtx) -> bool {
        self.state
            .attempt_ids
            .iter()
            .all(|id| ctx.status(id).is_none_or(|s| s.is_terminal()))
    }

    fn spawn_judge(&mut self, ctx: &mut HostCtx) {
        let attempts: Vec<(String, String)> = self
            .state
            .attempt_ids
            .iter()
            .filter_map(|id| ctx.branch_of(id).map(|branch| (id.clone(), branch)))
            .collect();

        let completed = self
            .state
            .attempt_ids
            .iter()
            .filter(|id| ctx.status(id) == Some(InstanceStatus::Completed))
            .count();
        if completed == 0 {
            warn!(group = %self.state.group_id, "triple-shot: no attempt completed, failing");
            ctx.error("Triple-shot failed: no attempt completed");
            self.state.phase = TripleShotPhase::Failed;
            return;
        }

        let prompt = build_judge_prompt(&self.state.task, &attempts);
        match ctx.spawn_instance(&prompt, Some(self.state.group_id.as_str())) {
            Ok(id) => {
                info!(judge = %id, "triple-shot: judge spawned");
                ctx.info("All attempts finished - judge is evaluating");
                self.state.judge_id = Some(id);
                self.state.phase = TripleShotPhase::Judging;
            }
            Err(e) => {
                ctx.error(format!("Triple-shot failed to spawn judge: {}", e));
                self.state.phase = TripleShotPhase::Failed;
            }
        }
    }

    /// Accept either an attempt id or a 1-based attempt ordinal
    fn resolve_winner(&self, raw: &str) -> Option<String> {
        if self.state.attempt_ids.iter().any(|id| id == raw) {
            return Some(raw.to_string());
        }
        let ordinal: usize = raw.trim_start_matches("attempt-").trim().parse().ok()?;
        (1..=self.state.attempt_ids.len())
            .contains(&ordinal)
            .then(|| self.state.attempt_ids[ordinal - 1].clone())
    }
}

impl Coordinator for TripleShotCoordinator {
    fn key(&self) -> WorkflowKey {
        WorkflowKey::TripleShot(self.state.group_id.clone())
    }

    fn display_phase(&self) -> String {
        format!("{:?}", self.state.phase)
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state.phase, TripleShotPhase::Complete | TripleShotPhase::Failed)
    }

    fn tick(&mut self, _ctx: &mut HostCtx) {}

    fn on_instance_state_change(&mut self, id: &str, _old: InstanceStatus, new: InstanceStatus, ctx: &mut HostCtx) {
        match self.state.phase {
            TripleShotPhase::Running => {
                if !self.state.attempt_ids.iter().any(|a| a == id) || !new.is_terminal() {
                    return;
                }
                // The judge runs once all three have ended, however they ended
                if self.all_attempts_terminal(ctx) {
                    self.spawn_judge(ctx);
                }
            }
            TripleShotPhase::Judging => {
                if self.state.judge_id.as_deref() == Some(id)
                    && matches!(new, InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout)
                {
                    ctx.error(format!("Triple-shot judge ended {:?}", new));
                    self.state.phase = TripleShotPhase::Failed;
                }
            }
            _ => {}
        }
    }

    fn on_artifact(
        &mut self,
        stage: ArtifactStage,
        _index: usize,
        result: Result<ArtifactPayload, String>,
        ctx: &mut HostCtx,
    ) {
        if self.state.phase != TripleShotPhase::Judging || stage != ArtifactStage::TripleShotVerdict {
            return;
        }
        match result {
            Ok(ArtifactPayload::TripleShotVerdict(verdict)) => match self.resolve_winner(&verdict.winner) {
                Some(winner) => {
                    info!(%winner, "triple-shot: winner chosen");
                    ctx.info(format!("Triple-shot winner: {}", winner));
                    self.state.winner_id = Some(winner);
                    self.state.phase = TripleShotPhase::Complete;
                }
                None => {
                    ctx.error(format!("Judge named unknown winner '{}'", verdict.winner));
                    self.state.phase = TripleShotPhase::Failed;
                }
            },
            Ok(_) => {}
            Err(reason) => {
                ctx.error(format!("Judge verdict unreadable: {}", reason));
                self.state.phase = TripleShotPhase::Failed;
            }
        }
    }

    fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest> {
        if self.state.phase != TripleShotPhase::Judging {
            return Vec::new();
        }
        self.state
            .judge_id
            .as_ref()
            .and_then(|id| orch.session.instance(id))
            .filter(|inst| inst.worktree_ready)
            .map(|inst| {
                vec![ArtifactRequest {
                    stage: ArtifactStage::TripleShotVerdict,
                    index: 0,
                    worktree: inst.worktree_path.clone(),
                }]
            })
            .unwrap_or_default()
    }

    fn cancel(&mut self, ctx: &mut HostCtx) {
        for id in self.state.instance_ids() {
            ctx.stop_instance(&id);
        }
        self.state.phase = TripleShotPhase::Failed;
        ctx.info("Triple-shot cancelled");
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
    use crate::artifacts::TripleShotVerdict;
    use crate::config::Config;
    use crate::driver::FakeDriver;
    use crate::events::EventBus;
    use crate::session::Session;
    use crate::vcs::GitBackend;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    async fn orchestrator() -> (Orchestrator, tempfile::TempDir, tempfile::TempDir) {
        let repo = tempdir().unwrap();
        let trees = tempdir().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            tokio::process::Command::new("git")
                .args(&args)
                .current_dir(repo.path())
                .output()
                .await
                .unwrap();
        }
        let mut config = Config::default();
        config.git.worktree_dir = trees.path().to_path_buf();
        let (tx, _rx) = mpsc::unbounded_channel();
        let orch = Orchestrator::new(
            Session::new("t", repo.path()),
            GitBackend::new(repo.path()),
            Arc::new(FakeDriver::new()),
            Arc::new(EventBus::new()),
            config,
            tx,
            None,
        )
        .await
        .unwrap();
        (orch, repo, trees)
    }

    fn force_status(orch: &mut Orchestrator, id: &str, status: InstanceStatus) {
        let inst = orch.session.instance_mut(id).unwrap();
        if status != InstanceStatus::Pending {
            let _ = inst.transition(InstanceStatus::Working);
            let _ = inst.transition(status);
        }
    }

    #[tokio::test]
    async fn test_start_creates_three_attempts_in_group() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let coord = TripleShotCoordinator::start(&mut ctx, "refactor X", TripleShotConfig::default()).unwrap();

        assert_eq!(coord.state.attempt_ids.len(), 3);
        assert_eq!(coord.state.phase, TripleShotPhase::Running);
        let group = ctx.orch.session.group(&coord.state.group_id).unwrap();
        assert_eq!(group.session_type, SessionType::TripleShot);
        assert_eq!(group.len(), 3);
    }

    #[tokio::test]
    async fn test_judge_spawned_when_all_terminal() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = TripleShotCoordinator::start(&mut ctx, "refactor X", TripleShotConfig::default()).unwrap();
        let attempts = coord.state.attempt_ids.clone();

        // Two complete, nothing yet
        for id in &attempts[..2] {
            force_status(ctx.orch, id, InstanceStatus::Completed);
            coord.on_instance_state_change(id, InstanceStatus::Working, InstanceStatus::Completed, &mut ctx);
        }
        assert_eq!(coord.state.phase, TripleShotPhase::Running);
        assert!(coord.state.judge_id.is_none());

        // Third terminates (with an error - still counts as terminal)
        force_status(ctx.orch, &attempts[2], InstanceStatus::Error);
        coord.on_instance_state_change(&attempts[2], InstanceStatus::Working, InstanceStatus::Error, &mut ctx);

        assert_eq!(coord.state.phase, TripleShotPhase::Judging);
        assert!(coord.state.judge_id.is_some());
        let infos: Vec<&super::super::DeferredAction> = ctx.actions.iter().collect();
        assert!(infos.iter().any(|a| matches!(a, super::super::DeferredAction::Info(m) if m.contains("judge is evaluating"))));
    }

    #[tokio::test]
    async fn test_no_completed_attempt_fails_instead_of_judging() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = TripleShotCoordinator::start(&mut ctx, "refactor X", TripleShotConfig::default()).unwrap();
        let attempts = coord.state.attempt_ids.clone();

        for id in &attempts {
            force_status(ctx.orch, id, InstanceStatus::Error);
            coord.on_instance_state_change(id, InstanceStatus::Working, InstanceStatus::Error, &mut ctx);
        }
        assert_eq!(coord.state.phase, TripleShotPhase::Failed);
    }

    #[tokio::test]
    async fn test_verdict_by_id_and_by_ordinal() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = TripleShotCoordinator::start(&mut ctx, "refactor X", TripleShotConfig::default()).unwrap();
        let attempts = coord.state.attempt_ids.clone();
        for id in &attempts {
            force_status(ctx.orch, id, InstanceStatus::Completed);
            coord.on_instance_state_change(id, InstanceStatus::Working, InstanceStatus::Completed, &mut ctx);
        }
        assert_eq!(coord.state.phase, TripleShotPhase::Judging);

        let verdict = TripleShotVerdict {
            winner: "2".to_string(),
            reasoning: "cleanest".to_string(),
        };
        coord.on_artifact(
            ArtifactStage::TripleShotVerdict,
            0,
            Ok(ArtifactPayload::TripleShotVerdict(verdict)),
            &mut ctx,
        );
        assert_eq!(coord.state.phase, TripleShotPhase::Complete);
        assert_eq!(coord.state.winner_id.as_ref(), Some(&attempts[1]));
    }

    #[tokio::test]
    async fn test_unknown_winner_fails() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = TripleShotCoordinator::start(&mut ctx, "refactor X", TripleShotConfig::default()).unwrap();
        for id in coord.state.attempt_ids.clone() {
            force_status(ctx.orch, &id, InstanceStatus::Completed);
            coord.on_instance_state_change(&id, InstanceStatus::Working, InstanceStatus::Completed, &mut ctx);
        }

        let verdict = TripleShotVerdict {
            winner: "not-an-attempt".to_string(),
            reasoning: String::new(),
        };
        coord.on_artifact(
            ArtifactStage::TripleShotVerdict,
            0,
            Ok(ArtifactPayload::TripleShotVerdict(verdict)),
            &mut ctx,
        );
        assert_eq!(coord.state.phase, TripleShotPhase::Failed);
    }

    #[tokio::test]
    async fn test_adversarial_followup_flag() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let config = TripleShotConfig {
            auto_approve: false,
            adversarial: true,
        };
        let mut coord = TripleShotCoordinator::start(&mut ctx, "refactor X", config).unwrap();
        assert!(!coord.wants_adversarial_followup());

        coord.state.winner_id = Some(coord.state.attempt_ids[0].clone());
        coord.state.phase = TripleShotPhase::Complete;
        assert!(coord.wants_adversarial_followup());
    }
}
