//! Multi-plan - N strategy planners compete, an evaluator picks or merges
//!
//! Standalone variant of the planning mechanics ultra-plan uses in
//! multi-pass mode. Completion surfaces the selected plan to the plan
//! editor; execution is the user's next move.

use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::{ArtifactPayload, ArtifactRequest, ArtifactStage};
use crate::orchestrator::Orchestrator;
use crate::plan::PlanSpec;
use crate::session::{InstanceStatus, SessionType};

use super::{
    Coordinator, HostCtx, PLANNER_STRATEGIES, PlannerPool, WorkflowKey, build_evaluator_prompt, resolve_decision,
};

/// Multi-plan phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiPlanPhase {
    #[default]
    Planning,
    Selection,
    Complete,
    Failed,
}

/// Persistent state of a multi-plan competition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPlanSession {
    pub objective: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub pool: PlannerPool,
    #[serde(default)]
    pub evaluator_id: Option<String>,
    #[serde(default)]
    pub selected_plan: Option<PlanSpec>,
    #[serde(default)]
    pub phase: MultiPlanPhase,
}

impl MultiPlanSession {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            group_id: String::new(),
            pool: PlannerPool::default(),
            evaluator_id: None,
            selected_plan: None,
            phase: MultiPlanPhase::Planning,
        }
    }
}

/// Coordinator for one multi-plan competition
#[derive(Debug)]
pub struct MultiPlanCoordinator {
    pub state: MultiPlanSession,
}

impl MultiPlanCoordinator {
    /// Spawn the planner pool and return the coordinator
    pub fn start(ctx: &mut HostCtx, objective: &str, planners: usize) -> Result<Self> {
        let mut state = MultiPlanSession::new(objective);
        state.group_id = ctx.create_group(
            &format!("multiplan: {}", truncate(objective, 40)),
            SessionType::PlanMulti,
            objective,
        );

        let strategies: Vec<&str> = PLANNER_STRATEGIES.iter().cycle().take(planners.max(1)).copied().collect();
        state.pool = PlannerPool::spawn(ctx, objective, &state.group_id, &strategies)?;
        ctx.info(format!("Multi-plan started with {} planners", state.pool.planner_ids.len()));
        Ok(Self { state })
    }

    /// Rebuild from a persisted session record
    pub fn from_state(state: MultiPlanSession) -> Self {
        Self { state }
    }

    fn fail(&mut self, ctx: &mut HostCtx, reason: &str) {
        warn!(group = %self.state.group_id, %reason, "multi-plan failed");
        ctx.error(format!("Multi-plan failed: {}", reason));
        self.state.phase = MultiPlanPhase::Failed;
    }

    fn check_planning_done(&mut self, ctx: &mut HostCtx) {
        if !self.state.pool.all_processed() {
            return;
        }
        let valid = self.state.pool.candidates.len();
        let total = self.state.pool.planner_ids.len();
        ctx.info(format!("{}/{} plans collected", valid, total));

        if self.state.pool.candidates.is_empty() {
            self.fail(ctx, "no planner produced a valid plan");
            return;
        }

        let prompt = build_evaluator_prompt(&self.state.objective, &self.state.pool.candidates);
        match ctx.spawn_instance(&prompt, Some(self.state.group_id.as_str())) {
            Ok(id) => {
                info!(evaluator = %id, "multi-plan: evaluator spawned");
                self.state.evaluator_id = Some(id);
                self.state.phase = MultiPlanPhase::Selection;
            }
            Err(e) => self.fail(ctx, &format!("failed to spawn evaluator: {}", e)),
        }
    }
}

impl Coordinator for MultiPlanCoordinator {
    fn key(&self) -> WorkflowKey {
        WorkflowKey::InlinePlan(self.state.group_id.clone())
    }

    fn display_phase(&self) -> String {
        format!("{:?}", self.state.phase)
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state.phase, MultiPlanPhase::Complete | MultiPlanPhase::Failed)
    }

    fn tick(&mut self, _ctx: &mut HostCtx) {}

    fn on_instance_state_change(&mut self, id: &str, _old: InstanceStatus, new: InstanceStatus, ctx: &mut HostCtx) {
        match self.state.phase {
            MultiPlanPhase::Planning => {
                // A planner that dies without an artifact counts as failed
                if matches!(new, InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout) {
                    if let Some(index) = self.state.pool.index_of(id) {
                        self.state.pool.record(index, Err(format!("planner instance ended {:?}", new)));
                        self.check_planning_done(ctx);
                    }
                }
            }
            MultiPlanPhase::Selection => {
                if self.state.evaluator_id.as_deref() == Some(id)
                    && matches!(new, InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout)
                {
                    self.fail(ctx, &format!("evaluator ended {:?}", new));
                }
            }
            _ => {}
        }
    }

    fn on_artifact(
        &mut self,
        stage: ArtifactStage,
        index: usize,
        result: Result<ArtifactPayload, String>,
        ctx: &mut HostCtx,
    ) {
        match (self.state.phase, stage) {
            (MultiPlanPhase::Planning, ArtifactStage::Plan) => {
                let outcome = match result {
                    Ok(ArtifactPayload::Plan(plan)) => Ok(plan),
                    Ok(other) => {
                        warn!(?other, "multi-plan: unexpected payload for Plan stage");
                        return;
                    }
                    // Invalid plans are silently dropped from the candidate set
                    Err(reason) => Err(reason),
                };
                self.state.pool.record(index, outcome);
                self.check_planning_done(ctx);
            }
            (MultiPlanPhase::Selection, ArtifactStage::Decision) => match result {
                Ok(ArtifactPayload::Decision(decision)) => {
                    match resolve_decision(&self.state.pool.candidates, decision) {
                        Ok(plan) => {
                            info!(tasks = plan.tasks.len(), "multi-plan: plan selected");
                            ctx.info("Plan selected - opening plan editor");
                            self.state.selected_plan = Some(plan);
                            self.state.phase = MultiPlanPhase::Complete;
                        }
                        Err(reason) => self.fail(ctx, &reason),
                    }
                }
                Ok(_) => {}
                Err(reason) => self.fail(ctx, &format!("evaluator decision unreadable: {}", reason)),
            },
            // Stale deliveries from an earlier phase are ignored
            _ => {}
        }
    }

    fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest> {
        match self.state.phase {
            MultiPlanPhase::Planning => self.state.pool.pending_artifacts(orch),
            MultiPlanPhase::Selection => self
                .state
                .evaluator_id
                .as_ref()
                .and_then(|id| orch.session.instance(id))
                .filter(|inst| inst.worktree_ready)
                .map(|inst| {
                    vec![ArtifactRequest {
                        stage: ArtifactStage::Decision,
                        index: 0,
                        worktree: inst.worktree_path.clone(),
                    }]
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn cancel(&mut self, ctx: &mut HostCtx) {
        for id in self.state.pool.planner_ids.clone() {
            ctx.stop_instance(&id);
        }
        if let Some(id) = self.state.evaluator_id.clone() {
            ctx.stop_instance(&id);
        }
        self.state.phase = MultiPlanPhase::Failed;
        ctx.info("Multi-plan cancelled");
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

    fn plan_with_task(id: &str) -> PlanSpec {
        PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![crate::plan::PlanTask {
                id: id.into(),
                title: id.into(),
                description: String::new(),
                files: vec![],
                depends_on: vec![],
                priority: 0,
                complexity: Default::default(),
            }],
        }
    }

    #[tokio::test]
    async fn test_start_spawns_planners_in_group() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let coord = MultiPlanCoordinator::start(&mut ctx, "build the thing", 3).unwrap();

        assert_eq!(coord.state.pool.planner_ids.len(), 3);
        assert_eq!(coord.state.phase, MultiPlanPhase::Planning);
        let group = ctx.orch.session.group(&coord.state.group_id).unwrap();
        assert_eq!(group.session_type, SessionType::PlanMulti);
        assert_eq!(group.instance_ids, coord.state.pool.planner_ids);
    }

    #[tokio::test]
    async fn test_two_valid_one_invalid_starts_evaluator() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = MultiPlanCoordinator::start(&mut ctx, "obj", 3).unwrap();

        coord.on_artifact(ArtifactStage::Plan, 0, Ok(ArtifactPayload::Plan(plan_with_task("a"))), &mut ctx);
        assert_eq!(coord.state.phase, MultiPlanPhase::Planning);

        coord.on_artifact(ArtifactStage::Plan, 1, Err("parse failure".into()), &mut ctx);
        coord.on_artifact(ArtifactStage::Plan, 2, Ok(ArtifactPayload::Plan(plan_with_task("b"))), &mut ctx);

        // Processed set reached 3; evaluator started with the 2 valid plans
        assert!(coord.state.pool.all_processed());
        assert_eq!(coord.state.pool.candidates.len(), 2);
        assert_eq!(coord.state.phase, MultiPlanPhase::Selection);
        assert!(coord.state.evaluator_id.is_some());

        // Info banner reported the collection count
        let infos: Vec<String> = ctx
            .actions
            .iter()
            .filter_map(|a| match a {
                super::super::DeferredAction::Info(m) => Some(m.clone()),
                _ => None,
            })
            .collect();
        assert!(infos.iter().any(|m| m.contains("2/3 plans collected")));
    }

    #[tokio::test]
    async fn test_all_invalid_fails() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = MultiPlanCoordinator::start(&mut ctx, "obj", 2).unwrap();

        coord.on_artifact(ArtifactStage::Plan, 0, Err("bad".into()), &mut ctx);
        coord.on_artifact(ArtifactStage::Plan, 1, Err("bad".into()), &mut ctx);
        assert_eq!(coord.state.phase, MultiPlanPhase::Failed);
    }

    #[tokio::test]
    async fn test_planner_death_counts_as_processed() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = MultiPlanCoordinator::start(&mut ctx, "obj", 2).unwrap();
        let planner0 = coord.state.pool.planner_ids[0].clone();

        coord.on_instance_state_change(&planner0, InstanceStatus::Working, InstanceStatus::Error, &mut ctx);
        coord.on_artifact(ArtifactStage::Plan, 1, Ok(ArtifactPayload::Plan(plan_with_task("a"))), &mut ctx);

        assert_eq!(coord.state.phase, MultiPlanPhase::Selection);
        assert_eq!(coord.state.pool.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_selection_completes_with_selected_plan() {
        use crate::artifacts::{DecisionAction, PlanDecision};
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = MultiPlanCoordinator::start(&mut ctx, "obj", 2).unwrap();

        coord.on_artifact(ArtifactStage::Plan, 0, Ok(ArtifactPayload::Plan(plan_with_task("a"))), &mut ctx);
        coord.on_artifact(ArtifactStage::Plan, 1, Ok(ArtifactPayload::Plan(plan_with_task("b"))), &mut ctx);

        let decision = PlanDecision {
            action: DecisionAction::Select,
            selected: Some(1),
            plan: PlanSpec::default(),
        };
        coord.on_artifact(ArtifactStage::Decision, 0, Ok(ArtifactPayload::Decision(decision)), &mut ctx);

        assert_eq!(coord.state.phase, MultiPlanPhase::Complete);
        assert!(coord.is_terminal());
        let plan = coord.state.selected_plan.as_ref().unwrap();
        assert_eq!(plan.tasks[0].id, "b");
    }

    #[tokio::test]
    async fn test_stale_artifact_after_phase_advance_ignored() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = MultiPlanCoordinator::start(&mut ctx, "obj", 1).unwrap();

        coord.on_artifact(ArtifactStage::Plan, 0, Ok(ArtifactPayload::Plan(plan_with_task("a"))), &mut ctx);
        assert_eq!(coord.state.phase, MultiPlanPhase::Selection);

        // A late duplicate planner delivery does nothing
        coord.on_artifact(ArtifactStage::Plan, 0, Err("late".into()), &mut ctx);
        assert_eq!(coord.state.phase, MultiPlanPhase::Selection);
        assert_eq!(coord.state.pool.candidates.len(), 1);
    }
}
