//! Ultra-plan - plan, decompose, execute, synthesize, consolidate
//!
//! The full pipeline: planners produce a task DAG, the user (or auto-approve)
//! signs it off, tasks execute layer by layer under a parallelism bound with
//! per-task retries, a reviewer synthesizes the aggregate result, bounded
//! revision rounds fix findings, and consolidation merges task branches into
//! per-group PRs. Decisions run on the UI loop; git work is delegated
//! through consolidation steps.

use std::collections::{BTreeMap, BTreeSet};

use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::{ArtifactPayload, ArtifactRequest, ArtifactStage, ReviewIssue};
use crate::config::WorkflowConfig;
use crate::events::Event;
use crate::orchestrator::Orchestrator;
use crate::plan::PlanSpec;
use crate::session::{InstanceStatus, SessionType};

use super::consolidation::{ConsolidationGroup, ConsolidationOutcome, ConsolidationPhase, ConsolidationState};
use super::{
    Coordinator, HostCtx, PLANNER_STRATEGIES, PlannerPool, WorkflowKey, build_evaluator_prompt, build_planner_prompt,
    build_reviser_prompt, build_synthesis_prompt, build_task_prompt, resolve_decision,
};

/// Ultra-plan phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UltraPlanPhase {
    #[default]
    Planning,
    PlanSelection,
    Refresh,
    Executing,
    Synthesis,
    Revision,
    Consolidating,
    Complete,
    Failed,
}

/// How task branches group into consolidation PRs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// One branch and PR for the whole plan
    #[default]
    Single,
    /// One branch and PR per execution layer
    PerLayer,
}

/// Config snapshot taken at workflow start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UltraPlanConfig {
    pub auto_approve: bool,
    pub review: bool,
    pub max_parallel: usize,
    pub max_task_retries: u32,
    pub require_verified_commits: bool,
    pub multi_pass: bool,
    pub consolidation_mode: ConsolidationMode,
    pub max_revisions: u32,
}

impl Default for UltraPlanConfig {
    fn default() -> Self {
        Self::from_workflow(&WorkflowConfig::default(), false)
    }
}

impl UltraPlanConfig {
    pub fn from_workflow(config: &WorkflowConfig, multi_pass: bool) -> Self {
        Self {
            auto_approve: config.auto_approve,
            review: config.review,
            max_parallel: config.max_parallel.max(1),
            max_task_retries: config.max_task_retries,
            require_verified_commits: config.require_verified_commits,
            multi_pass,
            consolidation_mode: ConsolidationMode::Single,
            max_revisions: config.max_revisions,
        }
    }
}

/// Task -> instance binding
///
/// Bindings are never removed; completion finalizes them so lookups keep
/// working after the instance is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBinding {
    pub instance_id: String,
    pub finalized: bool,
}

/// Revision loop substate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionState {
    pub round: u32,
    pub tasks_to_revise: Vec<String>,
    pub reviser_id: Option<String>,
}

/// Awaiting user input after a layer finished with mixed results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDecision {
    pub layer: usize,
    pub failed: Vec<String>,
    pub succeeded: Vec<String>,
}

/// The user's answer to a group decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecisionChoice {
    Continue,
    Retry,
    Cancel,
}

/// Persistent state of the ultra-plan pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UltraPlanSession {
    pub objective: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub phase: UltraPlanPhase,
    #[serde(default)]
    pub config: UltraPlanConfig,

    #[serde(default)]
    pub pool: PlannerPool,
    #[serde(default)]
    pub plan_manager_id: Option<String>,
    #[serde(default)]
    pub plan: Option<PlanSpec>,
    /// A gate is open and waiting for the user
    #[serde(default)]
    pub pending_approval: bool,

    #[serde(default)]
    pub exec_layers: Vec<Vec<String>>,
    #[serde(default)]
    pub current_layer: usize,
    #[serde(default)]
    pub task_to_instance: BTreeMap<String, TaskBinding>,
    #[serde(default)]
    pub completed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub failed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    /// Tasks whose instance completed but whose verified-commit count is
    /// still being checked
    #[serde(default)]
    pub awaiting_commit_check: BTreeSet<String>,

    #[serde(default)]
    pub synthesis_id: Option<String>,
    #[serde(default)]
    pub revision: RevisionState,
    #[serde(default)]
    pub consolidation: ConsolidationState,
    #[serde(default)]
    pub group_decision: Option<GroupDecision>,
}

impl UltraPlanSession {
    pub fn new(objective: impl Into<String>, config: UltraPlanConfig) -> Self {
        Self {
            objective: objective.into(),
            group_id: String::new(),
            phase: UltraPlanPhase::Planning,
            config,
            pool: PlannerPool::default(),
            plan_manager_id: None,
            plan: None,
            pending_approval: false,
            exec_layers: Vec::new(),
            current_layer: 0,
            task_to_instance: BTreeMap::new(),
            completed_tasks: BTreeSet::new(),
            failed_tasks: BTreeSet::new(),
            retries: BTreeMap::new(),
            awaiting_commit_check: BTreeSet::new(),
            synthesis_id: None,
            revision: RevisionState::default(),
            consolidation: ConsolidationState::default(),
            group_decision: None,
        }
    }
}

/// Coordinator driving the ultra-plan phase machine
#[derive(Debug)]
pub struct UltraPlanCoordinator {
    pub state: UltraPlanSession,
}

impl UltraPlanCoordinator {
    /// Start planning, or jump straight to review when a plan file was given
    pub fn start(
        ctx: &mut HostCtx,
        objective: &str,
        config: UltraPlanConfig,
        preloaded_plan: Option<PlanSpec>,
    ) -> Result<Self> {
        let mut state = UltraPlanSession::new(objective, config);
        state.group_id = ctx.create_group(
            &format!("ultra-plan: {}", truncate(objective, 40)),
            SessionType::UltraPlan,
            objective,
        );

        let mut coordinator = Self { state };
        if let Some(plan) = preloaded_plan {
            plan.validate().map_err(|e| eyre::eyre!("plan file invalid: {}", e))?;
            info!(tasks = plan.tasks.len(), "ultra-plan: using preloaded plan");
            coordinator.state.plan = Some(plan);
            coordinator.enter_refresh(ctx);
        } else if coordinator.state.config.multi_pass {
            coordinator.state.pool =
                PlannerPool::spawn(ctx, objective, &coordinator.state.group_id.clone(), PLANNER_STRATEGIES)?;
            ctx.info(format!(
                "Ultra-plan started: {} strategy planners working",
                PLANNER_STRATEGIES.len()
            ));
        } else {
            let prompt = build_planner_prompt(objective, None);
            let group = coordinator.state.group_id.clone();
            let id = ctx.spawn_instance(&prompt, Some(group.as_str()))?;
            coordinator.state.pool.planner_ids.push(id);
            coordinator.state.pool.strategies.push("single".to_string());
            ctx.info("Ultra-plan started: planner working");
        }
        Ok(coordinator)
    }

    pub fn from_state(state: UltraPlanSession) -> Self {
        Self { state }
    }

    fn fail(&mut self, ctx: &mut HostCtx, reason: &str) {
        warn!(%reason, "ultra-plan failed");
        ctx.error(format!("Ultra-plan failed: {}", reason));
        self.state.phase = UltraPlanPhase::Failed;
    }

    // === Planning / selection ===

    fn planning_progress(&mut self, ctx: &mut HostCtx) {
        let valid = self.state.pool.candidates.len();
        let total = self.state.pool.planner_ids.len();
        ctx.info(format!("{}/{} plans collected", valid, total));

        if !self.state.pool.all_processed() {
            return;
        }
        if self.state.pool.candidates.is_empty() {
            self.fail(ctx, "all candidate plans invalid");
            return;
        }

        let prompt = build_evaluator_prompt(&self.state.objective, &self.state.pool.candidates);
        let group = self.state.group_id.clone();
        match ctx.spawn_instance(&prompt, Some(group.as_str())) {
            Ok(id) => {
                info!(manager = %id, "ultra-plan: plan manager spawned");
                self.state.plan_manager_id = Some(id);
                self.state.phase = UltraPlanPhase::PlanSelection;
            }
            Err(e) => self.fail(ctx, &format!("failed to spawn plan manager: {}", e)),
        }
    }

    fn enter_refresh(&mut self, ctx: &mut HostCtx) {
        self.state.phase = UltraPlanPhase::Refresh;
        if self.state.config.review || !self.state.config.auto_approve {
            self.state.pending_approval = true;
            ctx.info("Plan ready - review and approve to execute");
        } else {
            self.start_execution(ctx);
        }
    }

    /// Plan-editor cancellation keeps the selected plan and the open gate;
    /// selection stays complete
    pub fn plan_editing_cancelled(&mut self, ctx: &mut HostCtx) {
        if self.state.phase == UltraPlanPhase::Refresh {
            ctx.info("Plan editing cancelled - plan retained, awaiting approval");
        }
    }

    /// Approve the currently open gate (plan review or synthesis findings)
    pub fn approve(&mut self, ctx: &mut HostCtx) {
        if !self.state.pending_approval {
            return;
        }
        self.state.pending_approval = false;
        match self.state.phase {
            UltraPlanPhase::Refresh => self.start_execution(ctx),
            UltraPlanPhase::Synthesis => self.enter_consolidating(ctx),
            _ => {}
        }
    }

    /// Replace the plan from the editor; must stay valid
    pub fn replace_plan(&mut self, plan: PlanSpec, ctx: &mut HostCtx) {
        if self.state.phase != UltraPlanPhase::Refresh {
            return;
        }
        match plan.validate() {
            Ok(()) => self.state.plan = Some(plan),
            Err(e) => ctx.error(format!("Edited plan rejected: {}", e)),
        }
    }

    // === Execution ===

    fn start_execution(&mut self, ctx: &mut HostCtx) {
        let Some(plan) = self.state.plan.clone() else {
            self.fail(ctx, "no plan at execution start");
            return;
        };
        let layers = match plan.execution_order() {
            Ok(layers) => layers,
            Err(e) => {
                self.fail(ctx, &format!("plan not executable: {}", e));
                return;
            }
        };

        info!(layers = layers.len(), tasks = plan.tasks.len(), "ultra-plan: executing");
        ctx.info(format!(
            "Executing plan: {} tasks in {} layers",
            plan.tasks.len(),
            layers.len()
        ));
        self.state.exec_layers = layers;
        self.state.current_layer = 0;
        self.state.phase = UltraPlanPhase::Executing;
        self.fill_layer_slots(ctx);
    }

    fn running_count(&self, ctx: &HostCtx) -> usize {
        self.state
            .task_to_instance
            .values()
            .filter(|b| !b.finalized)
            .filter(|b| ctx.status(&b.instance_id).is_none_or(|s| !s.is_terminal()))
            .count()
    }

    fn spawn_task(&mut self, task_id: &str, ctx: &mut HostCtx) {
        let Some(plan) = &self.state.plan else { return };
        let Some(task) = plan.task(task_id) else {
            self.fail(ctx, &format!("plan lost task {}", task_id));
            return;
        };
        let prompt = build_task_prompt(&self.state.objective, &task.id, &task.title, &task.description, &task.files);
        let group = self.state.group_id.clone();
        match ctx.spawn_instance(&prompt, Some(group.as_str())) {
            Ok(instance_id) => {
                info!(%task_id, %instance_id, "ultra-plan: task instance spawned");
                self.state.task_to_instance.insert(
                    task_id.to_string(),
                    TaskBinding {
                        instance_id,
                        finalized: false,
                    },
                );
            }
            Err(e) => {
                warn!(%task_id, error = %e, "ultra-plan: task spawn failed");
                self.state.failed_tasks.insert(task_id.to_string());
            }
        }
    }

    /// Start unstarted tasks in the current layer up to the parallelism bound
    fn fill_layer_slots(&mut self, ctx: &mut HostCtx) {
        let Some(layer) = self.state.exec_layers.get(self.state.current_layer).cloned() else {
            return;
        };
        let mut running = self.running_count(ctx);
        for task_id in layer {
            if running >= self.state.config.max_parallel {
                break;
            }
            let started = self.state.completed_tasks.contains(&task_id)
                || self.state.failed_tasks.contains(&task_id)
                || self.state.awaiting_commit_check.contains(&task_id)
                || self
                    .state
                    .task_to_instance
                    .get(&task_id)
                    .is_some_and(|b| !b.finalized);
            if started {
                continue;
            }
            self.spawn_task(&task_id, ctx);
            running += 1;
        }
    }

    fn task_for_instance(&self, instance_id: &str) -> Option<String> {
        self.state
            .task_to_instance
            .iter()
            .find(|(_, b)| b.instance_id == instance_id && !b.finalized)
            .map(|(task, _)| task.clone())
    }

    fn task_completed(&mut self, task_id: &str, ctx: &mut HostCtx) {
        self.state.completed_tasks.insert(task_id.to_string());
        self.state.awaiting_commit_check.remove(task_id);
        if let Some(binding) = self.state.task_to_instance.get_mut(task_id) {
            binding.finalized = true;
        }
        info!(%task_id, "ultra-plan: task complete");
        ctx.info(format!("Task {} complete", task_id));
        self.fill_layer_slots(ctx);
        self.check_layer_done(ctx);
    }

    fn task_failed_attempt(&mut self, task_id: &str, reason: &str, ctx: &mut HostCtx) {
        let attempts = self.state.retries.entry(task_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= self.state.config.max_task_retries {
            let attempt = *attempts;
            ctx.info(format!(
                "Task {} failed ({}) - retry {}/{}",
                task_id, reason, attempt, self.state.config.max_task_retries
            ));
            self.spawn_task(task_id, ctx);
            return;
        }

        warn!(%task_id, %reason, "ultra-plan: task failed permanently");
        ctx.error(format!("Task {} failed permanently: {}", task_id, reason));
        self.state.failed_tasks.insert(task_id.to_string());
        if let Some(binding) = self.state.task_to_instance.get_mut(task_id) {
            binding.finalized = true;
        }
        self.fill_layer_slots(ctx);
        self.check_layer_done(ctx);
    }

    /// Verified-commit count arrived for a task that reported completion
    pub fn on_commit_check(&mut self, task_id: &str, commits: u32, ctx: &mut HostCtx) {
        if !self.state.awaiting_commit_check.contains(task_id) {
            return;
        }
        if commits >= 1 {
            self.task_completed(task_id, ctx);
        } else {
            self.state.awaiting_commit_check.remove(task_id);
            self.task_failed_attempt(task_id, "no verified commits", ctx);
        }
    }

    fn check_layer_done(&mut self, ctx: &mut HostCtx) {
        let Some(layer) = self.state.exec_layers.get(self.state.current_layer) else {
            return;
        };
        let done = layer.iter().all(|t| {
            (self.state.completed_tasks.contains(t) || self.state.failed_tasks.contains(t))
                && !self.state.awaiting_commit_check.contains(t)
        });
        if !done {
            return;
        }

        let failed: Vec<String> = layer.iter().filter(|t| self.state.failed_tasks.contains(*t)).cloned().collect();
        let succeeded: Vec<String> = layer
            .iter()
            .filter(|t| self.state.completed_tasks.contains(*t))
            .cloned()
            .collect();

        if failed.is_empty() {
            self.advance_layer(ctx);
        } else if succeeded.is_empty() {
            self.fail(ctx, &format!("every task in layer {} failed", self.state.current_layer + 1));
        } else {
            ctx.info(format!(
                "Layer {} finished with {} failure(s) - continue, retry, or cancel?",
                self.state.current_layer + 1,
                failed.len()
            ));
            self.state.group_decision = Some(GroupDecision {
                layer: self.state.current_layer,
                failed,
                succeeded,
            });
        }
    }

    /// Apply the user's answer to a pending group decision
    pub fn resolve_group_decision(&mut self, choice: GroupDecisionChoice, ctx: &mut HostCtx) {
        let Some(decision) = self.state.group_decision.take() else {
            return;
        };
        match choice {
            GroupDecisionChoice::Continue => {
                ctx.info("Continuing past failed tasks");
                self.advance_layer(ctx);
            }
            GroupDecisionChoice::Retry => {
                ctx.info(format!("Retrying {} failed task(s)", decision.failed.len()));
                for task_id in &decision.failed {
                    self.state.failed_tasks.remove(task_id);
                    self.state.retries.insert(task_id.clone(), 0);
                }
                for task_id in decision.failed {
                    self.spawn_task(&task_id, ctx);
                }
            }
            GroupDecisionChoice::Cancel => self.cancel(ctx),
        }
    }

    fn advance_layer(&mut self, ctx: &mut HostCtx) {
        self.state.current_layer += 1;
        if self.state.current_layer < self.state.exec_layers.len() {
            self.fill_layer_slots(ctx);
        } else {
            self.enter_synthesis(ctx);
        }
    }

    // === Synthesis / revision ===

    fn enter_synthesis(&mut self, ctx: &mut HostCtx) {
        let branches: Vec<(String, String)> = self
            .state
            .completed_tasks
            .iter()
            .filter_map(|task| {
                let binding = self.state.task_to_instance.get(task)?;
                let branch = ctx.branch_of(&binding.instance_id)?;
                Some((task.clone(), branch))
            })
            .collect();
        if branches.is_empty() {
            self.fail(ctx, "nothing completed to synthesize");
            return;
        }

        let prompt = build_synthesis_prompt(&self.state.objective, &branches);
        let group = self.state.group_id.clone();
        match ctx.spawn_instance(&prompt, Some(group.as_str())) {
            Ok(id) => {
                info!(reviewer = %id, "ultra-plan: synthesis reviewer spawned");
                ctx.info("All layers done - synthesis reviewer inspecting the aggregate diff");
                self.state.synthesis_id = Some(id);
                self.state.phase = UltraPlanPhase::Synthesis;
                self.state.pending_approval = false;
            }
            Err(e) => self.fail(ctx, &format!("failed to spawn reviewer: {}", e)),
        }
    }

    fn on_review(&mut self, approved: bool, issues: Vec<ReviewIssue>, ctx: &mut HostCtx) {
        if approved || issues.is_empty() {
            if self.state.config.auto_approve {
                self.enter_consolidating(ctx);
            } else {
                self.state.pending_approval = true;
                ctx.info("Synthesis approved - confirm to consolidate");
            }
            return;
        }

        if self.state.revision.round >= self.state.config.max_revisions {
            ctx.info(format!(
                "Revision budget exhausted after {} round(s) - consolidating with {} open issue(s)",
                self.state.revision.round,
                issues.len()
            ));
            if self.state.config.auto_approve {
                self.enter_consolidating(ctx);
            } else {
                self.state.pending_approval = true;
            }
            return;
        }

        self.enter_revision(issues, ctx);
    }

    fn enter_revision(&mut self, issues: Vec<ReviewIssue>, ctx: &mut HostCtx) {
        self.state.revision.round += 1;
        let mut tasks: Vec<String> = issues.iter().map(|i| i.task_id.clone()).collect();
        tasks.dedup();
        self.state.revision.tasks_to_revise = tasks;

        let pairs: Vec<(String, String)> = issues.into_iter().map(|i| (i.task_id, i.summary)).collect();
        let prompt = build_reviser_prompt(&self.state.objective, &pairs);
        let group = self.state.group_id.clone();
        match ctx.spawn_instance(&prompt, Some(group.as_str())) {
            Ok(id) => {
                info!(round = self.state.revision.round, reviser = %id, "ultra-plan: revision round");
                ctx.info(format!(
                    "Revision round {}: fixing {} issue(s)",
                    self.state.revision.round,
                    pairs.len()
                ));
                self.state.revision.reviser_id = Some(id);
                self.state.phase = UltraPlanPhase::Revision;
            }
            Err(e) => self.fail(ctx, &format!("failed to spawn reviser: {}", e)),
        }
    }

    // === Consolidation ===

    fn enter_consolidating(&mut self, ctx: &mut HostCtx) {
        // Completed tasks in dependency order (layer order is dependency order)
        let ordered: Vec<String> = self
            .state
            .exec_layers
            .iter()
            .flatten()
            .filter(|t| self.state.completed_tasks.contains(*t))
            .cloned()
            .collect();
        if ordered.is_empty() {
            self.fail(ctx, "no completed tasks to consolidate");
            return;
        }

        let task_groups: Vec<(String, Vec<String>)> = match self.state.config.consolidation_mode {
            ConsolidationMode::Single => vec![("all tasks".to_string(), ordered)],
            ConsolidationMode::PerLayer => self
                .state
                .exec_layers
                .iter()
                .enumerate()
                .filter_map(|(i, layer)| {
                    let tasks: Vec<String> = layer
                        .iter()
                        .filter(|t| self.state.completed_tasks.contains(*t))
                        .cloned()
                        .collect();
                    (!tasks.is_empty()).then(|| (format!("layer {}", i + 1), tasks))
                })
                .collect(),
        };

        let worktree_dir = ctx.worktree_dir();
        let groups: Vec<ConsolidationGroup> = task_groups
            .into_iter()
            .enumerate()
            .map(|(i, (name, task_ids))| {
                let task_branches = task_ids
                    .iter()
                    .filter_map(|t| {
                        let binding = self.state.task_to_instance.get(t)?;
                        ctx.branch_of(&binding.instance_id)
                    })
                    .collect();
                ConsolidationGroup {
                    name,
                    branch: format!("claudio/consolidate-{}", i + 1),
                    task_ids,
                    task_branches,
                    merged: 0,
                    pr_url: None,
                    worktree: worktree_dir.join(format!("consolidate-{}", i + 1)),
                }
            })
            .collect();

        info!(groups = groups.len(), "ultra-plan: consolidating");
        ctx.info(format!("Consolidating into {} group(s)", groups.len()));
        self.state.consolidation = ConsolidationState {
            phase: ConsolidationPhase::CreatingBranches,
            groups,
            current_group: 0,
            conflict_files: Vec::new(),
            error: None,
        };
        self.state.phase = UltraPlanPhase::Consolidating;
        self.issue_next_consolidation_step(ctx);
    }

    fn issue_next_consolidation_step(&mut self, ctx: &mut HostCtx) {
        let base = ctx.main_branch();
        if let Some(step) = self.state.consolidation.next_step(&base) {
            ctx.request_consolidation(step);
        }
    }

    /// A consolidation step finished; advance the sub-machine
    pub fn on_consolidation(&mut self, outcome: ConsolidationOutcome, ctx: &mut HostCtx) {
        if self.state.phase != UltraPlanPhase::Consolidating {
            return;
        }

        match &outcome {
            ConsolidationOutcome::MergeConflict { files, group_index } => {
                let worktree = self
                    .state
                    .consolidation
                    .groups
                    .get(*group_index)
                    .map(|g| g.worktree.display().to_string())
                    .unwrap_or_default();
                ctx.error(format!(
                    "Merge conflict in {} - resolve in {} and resume",
                    files.join(", "),
                    worktree
                ));
            }
            ConsolidationOutcome::PrOpened { group_index, url } => {
                ctx.info(format!("PR opened: {}", url));
                // Workflow-driven completion event, tagged with the group's
                // first task instance
                if let Some(instance_id) = self
                    .state
                    .consolidation
                    .groups
                    .get(*group_index)
                    .and_then(|g| g.task_ids.first())
                    .and_then(|t| self.state.task_to_instance.get(t))
                    .map(|b| b.instance_id.clone())
                {
                    ctx.publish(Event::PrCompleted {
                        instance_id,
                        success: true,
                    });
                }
            }
            ConsolidationOutcome::StepFailed { error, .. } => {
                ctx.error(format!("Consolidation failed: {}", error));
            }
            _ => {}
        }

        let done = self.state.consolidation.apply(&outcome);
        if done {
            self.state.phase = UltraPlanPhase::Complete;
            ctx.info("Ultra-plan complete");
            return;
        }
        match self.state.consolidation.phase {
            ConsolidationPhase::Failed => self.state.phase = UltraPlanPhase::Failed,
            ConsolidationPhase::Paused => {}
            _ => self.issue_next_consolidation_step(ctx),
        }
    }

    /// User resolved the conflict and asked to resume
    pub fn resume_consolidation(&mut self, ctx: &mut HostCtx) {
        if self.state.consolidation.resume() {
            ctx.info("Resuming consolidation");
            self.issue_next_consolidation_step(ctx);
        }
    }
}

impl Coordinator for UltraPlanCoordinator {
    fn key(&self) -> WorkflowKey {
        WorkflowKey::UltraPlan
    }

    fn display_phase(&self) -> String {
        match self.state.phase {
            UltraPlanPhase::Consolidating => format!("Consolidating ({:?})", self.state.consolidation.phase),
            phase => format!("{:?}", phase),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state.phase, UltraPlanPhase::Complete | UltraPlanPhase::Failed)
    }

    fn tick(&mut self, _ctx: &mut HostCtx) {}

    fn on_instance_state_change(&mut self, id: &str, _old: InstanceStatus, new: InstanceStatus, ctx: &mut HostCtx) {
        let died = matches!(new, InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout);

        match self.state.phase {
            UltraPlanPhase::Planning => {
                if died {
                    if let Some(index) = self.state.pool.index_of(id) {
                        self.state.pool.record(index, Err(format!("planner ended {:?}", new)));
                        if self.state.config.multi_pass {
                            self.planning_progress(ctx);
                        } else {
                            self.fail(ctx, &format!("planner ended {:?}", new));
                        }
                    }
                }
            }
            UltraPlanPhase::PlanSelection => {
                if died && self.state.plan_manager_id.as_deref() == Some(id) {
                    self.fail(ctx, &format!("plan manager ended {:?}", new));
                }
            }
            UltraPlanPhase::Executing => {
                let Some(task_id) = self.task_for_instance(id) else { return };
                match new {
                    InstanceStatus::Completed => {
                        if self.state.config.require_verified_commits {
                            self.state.awaiting_commit_check.insert(task_id.clone());
                            ctx.request_commit_check(WorkflowKey::UltraPlan, &task_id, id);
                        } else {
                            self.task_completed(&task_id, ctx);
                        }
                    }
                    InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout => {
                        self.task_failed_attempt(&task_id, &format!("instance ended {:?}", new), ctx);
                    }
                    _ => {}
                }
            }
            UltraPlanPhase::Synthesis => {
                if died && self.state.synthesis_id.as_deref() == Some(id) {
                    self.fail(ctx, &format!("synthesis reviewer ended {:?}", new));
                }
            }
            UltraPlanPhase::Revision => {
                if self.state.revision.reviser_id.as_deref() != Some(id) {
                    return;
                }
                if new == InstanceStatus::Completed {
                    // Revised work goes back through synthesis
                    self.enter_synthesis(ctx);
                } else if died {
                    self.fail(ctx, &format!("reviser ended {:?}", new));
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
            (UltraPlanPhase::Planning, ArtifactStage::Plan) => {
                if self.state.config.multi_pass {
                    let outcome = match result {
                        Ok(ArtifactPayload::Plan(plan)) => Ok(plan),
                        Ok(_) => return,
                        Err(reason) => Err(reason),
                    };
                    self.state.pool.record(index, outcome);
                    self.planning_progress(ctx);
                } else {
                    match result {
                        Ok(ArtifactPayload::Plan(plan)) => {
                            // First successful parse wins in single-pass mode
                            self.state.pool.record(index, Ok(plan.clone()));
                            self.state.plan = Some(plan);
                            self.enter_refresh(ctx);
                        }
                        Ok(_) => {}
                        Err(reason) => self.fail(ctx, &format!("planner output invalid: {}", reason)),
                    }
                }
            }
            (UltraPlanPhase::PlanSelection, ArtifactStage::Decision) => match result {
                Ok(ArtifactPayload::Decision(decision)) => {
                    match resolve_decision(&self.state.pool.candidates, decision) {
                        Ok(plan) => {
                            info!(tasks = plan.tasks.len(), "ultra-plan: plan selected");
                            self.state.plan = Some(plan);
                            self.enter_refresh(ctx);
                        }
                        Err(reason) => self.fail(ctx, &reason),
                    }
                }
                Ok(_) => {}
                Err(reason) => self.fail(ctx, &format!("plan manager decision unreadable: {}", reason)),
            },
            (UltraPlanPhase::Synthesis, ArtifactStage::Review) => match result {
                Ok(ArtifactPayload::Review(report)) => {
                    info!(approved = report.approved, issues = report.issues.len(), "ultra-plan: review");
                    self.on_review(report.approved, report.issues, ctx);
                }
                Ok(_) => {}
                Err(reason) => self.fail(ctx, &format!("review unreadable: {}", reason)),
            },
            // Deliveries for a phase we already left are ignored
            _ => {}
        }
    }

    fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest> {
        let singleton = |id: &Option<String>, stage: ArtifactStage| -> Vec<ArtifactRequest> {
            id.as_ref()
                .and_then(|id| orch.session.instance(id))
                .filter(|inst| inst.worktree_ready)
                .map(|inst| {
                    vec![ArtifactRequest {
                        stage,
                        index: 0,
                        worktree: inst.worktree_path.clone(),
                    }]
                })
                .unwrap_or_default()
        };

        match self.state.phase {
            UltraPlanPhase::Planning => self.state.pool.pending_artifacts(orch),
            UltraPlanPhase::PlanSelection => singleton(&self.state.plan_manager_id, ArtifactStage::Decision),
            UltraPlanPhase::Synthesis => singleton(&self.state.synthesis_id, ArtifactStage::Review),
            _ => Vec::new(),
        }
    }

    fn cancel(&mut self, ctx: &mut HostCtx) {
        let mut ids: Vec<String> = self.state.pool.planner_ids.clone();
        ids.extend(self.state.plan_manager_id.clone());
        ids.extend(self.state.synthesis_id.clone());
        ids.extend(self.state.revision.reviser_id.clone());
        ids.extend(self.state.task_to_instance.values().map(|b| b.instance_id.clone()));
        for id in ids {
            ctx.stop_instance(&id);
        }
        self.state.phase = UltraPlanPhase::Failed;
        ctx.info("Ultra-plan cancelled");
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
    use crate::artifacts::{DecisionAction, PlanDecision, ReviewReport};
    use crate::config::Config;
    use crate::driver::FakeDriver;
    use crate::events::EventBus;
    use crate::plan::PlanTask;
    use crate::session::Session;
    use crate::vcs::GitBackend;
    use crate::workflows::DeferredAction;
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

    fn task(id: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            id: id.into(),
            title: format!("Task {}", id),
            description: String::new(),
            files: vec![],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            complexity: Default::default(),
        }
    }

    fn two_layer_plan() -> PlanSpec {
        PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])],
        }
    }

    fn config(auto_approve: bool, verified: bool) -> UltraPlanConfig {
        UltraPlanConfig {
            auto_approve,
            review: false,
            max_parallel: 4,
            max_task_retries: 1,
            require_verified_commits: verified,
            multi_pass: false,
            consolidation_mode: ConsolidationMode::Single,
            max_revisions: 2,
        }
    }

    fn instance_completed(coord: &mut UltraPlanCoordinator, ctx: &mut HostCtx, task_id: &str) {
        let instance = coord.state.task_to_instance[task_id].instance_id.clone();
        let inst = ctx.orch.session.instance_mut(&instance).unwrap();
        inst.transition(InstanceStatus::Working).unwrap();
        inst.transition(InstanceStatus::Completed).unwrap();
        coord.on_instance_state_change(&instance, InstanceStatus::Working, InstanceStatus::Completed, ctx);
    }

    fn instance_errored(coord: &mut UltraPlanCoordinator, ctx: &mut HostCtx, task_id: &str) {
        let instance = coord.state.task_to_instance[task_id].instance_id.clone();
        let inst = ctx.orch.session.instance_mut(&instance).unwrap();
        inst.transition(InstanceStatus::Working).unwrap();
        inst.transition(InstanceStatus::Error).unwrap();
        coord.on_instance_state_change(&instance, InstanceStatus::Working, InstanceStatus::Error, ctx);
    }

    #[tokio::test]
    async fn test_preloaded_plan_enters_refresh_gate() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let coord =
            UltraPlanCoordinator::start(&mut ctx, "obj", config(false, false), Some(two_layer_plan())).unwrap();
        assert_eq!(coord.state.phase, UltraPlanPhase::Refresh);
        assert!(coord.state.pending_approval);
    }

    #[tokio::test]
    async fn test_single_pass_plan_artifact_to_refresh() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", config(false, false), None).unwrap();
        assert_eq!(coord.state.phase, UltraPlanPhase::Planning);
        assert_eq!(coord.state.pool.planner_ids.len(), 1);

        coord.on_artifact(ArtifactStage::Plan, 0, Ok(ArtifactPayload::Plan(two_layer_plan())), &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Refresh);
        assert!(coord.state.pending_approval);
    }

    #[tokio::test]
    async fn test_plan_editor_cancel_keeps_refresh() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord =
            UltraPlanCoordinator::start(&mut ctx, "obj", config(false, false), Some(two_layer_plan())).unwrap();

        coord.plan_editing_cancelled(&mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Refresh);
        assert!(coord.state.pending_approval);
        assert!(coord.state.plan.is_some());
    }

    #[tokio::test]
    async fn test_multi_pass_planning_to_selection_to_refresh() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut cfg = config(true, false);
        cfg.multi_pass = true;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, None).unwrap();
        assert_eq!(coord.state.pool.planner_ids.len(), PLANNER_STRATEGIES.len());

        coord.on_artifact(ArtifactStage::Plan, 0, Ok(ArtifactPayload::Plan(two_layer_plan())), &mut ctx);
        coord.on_artifact(ArtifactStage::Plan, 1, Err("garbage".into()), &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Planning);
        coord.on_artifact(ArtifactStage::Plan, 2, Ok(ArtifactPayload::Plan(two_layer_plan())), &mut ctx);

        // Property: parsed candidates == non-failed planners
        assert_eq!(
            coord.state.pool.candidates.len(),
            coord.state.pool.planner_ids.len() - coord.state.pool.failed.len()
        );
        assert_eq!(coord.state.phase, UltraPlanPhase::PlanSelection);

        let decision = PlanDecision {
            action: DecisionAction::Select,
            selected: Some(0),
            plan: PlanSpec::default(),
        };
        coord.on_artifact(ArtifactStage::Decision, 0, Ok(ArtifactPayload::Decision(decision)), &mut ctx);
        // auto_approve and no review: goes straight through Refresh into Executing
        assert_eq!(coord.state.phase, UltraPlanPhase::Executing);
    }

    #[tokio::test]
    async fn test_execution_layers_and_synthesis() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord =
            UltraPlanCoordinator::start(&mut ctx, "obj", config(true, false), Some(two_layer_plan())).unwrap();
        assert_eq!(coord.state.phase, UltraPlanPhase::Executing);

        // Layer 1 spawned a and b, not yet c
        assert!(coord.state.task_to_instance.contains_key("a"));
        assert!(coord.state.task_to_instance.contains_key("b"));
        assert!(!coord.state.task_to_instance.contains_key("c"));

        instance_completed(&mut coord, &mut ctx, "a");
        assert!(!coord.state.task_to_instance.contains_key("c"), "layer gate holds");
        instance_completed(&mut coord, &mut ctx, "b");
        assert!(coord.state.task_to_instance.contains_key("c"), "layer 2 started");

        instance_completed(&mut coord, &mut ctx, "c");
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);
        assert!(coord.state.synthesis_id.is_some());
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_layer() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[]), task("b", &[]), task("c", &[]), task("d", &[])],
        };
        let mut cfg = config(true, false);
        cfg.max_parallel = 2;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();

        assert_eq!(coord.state.task_to_instance.len(), 2);

        // Completing one frees a slot
        let first = coord.state.task_to_instance.keys().next().unwrap().clone();
        instance_completed(&mut coord, &mut ctx, &first);
        assert_eq!(coord.state.task_to_instance.len(), 3);
    }

    #[tokio::test]
    async fn test_task_retry_then_permanent_failure() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[])],
        };
        // max_task_retries = 1
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", config(true, false), Some(plan)).unwrap();

        let original = coord.state.task_to_instance["a"].instance_id.clone();
        instance_errored(&mut coord, &mut ctx, "a");
        // Retried with a fresh instance
        let retried = coord.state.task_to_instance["a"].instance_id.clone();
        assert_ne!(original, retried);
        assert!(!coord.state.failed_tasks.contains("a"));

        // Second failure exceeds the budget; whole layer failed -> Failed
        instance_errored(&mut coord, &mut ctx, "a");
        assert!(coord.state.failed_tasks.contains("a"));
        assert_eq!(coord.state.phase, UltraPlanPhase::Failed);
    }

    #[tokio::test]
    async fn test_mixed_layer_raises_group_decision() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[]), task("b", &[])],
        };
        let mut cfg = config(true, false);
        cfg.max_task_retries = 0;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();

        instance_completed(&mut coord, &mut ctx, "a");
        instance_errored(&mut coord, &mut ctx, "b");

        let decision = coord.state.group_decision.as_ref().expect("group decision pending");
        assert_eq!(decision.failed, vec!["b"]);
        assert_eq!(decision.succeeded, vec!["a"]);
        assert_eq!(coord.state.phase, UltraPlanPhase::Executing);

        // Continue moves on to synthesis (no more layers)
        coord.resolve_group_decision(GroupDecisionChoice::Continue, &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);
    }

    #[tokio::test]
    async fn test_group_decision_retry_respawns() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[]), task("b", &[])],
        };
        let mut cfg = config(true, false);
        cfg.max_task_retries = 0;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();

        instance_completed(&mut coord, &mut ctx, "a");
        let failed_instance = coord.state.task_to_instance["b"].instance_id.clone();
        instance_errored(&mut coord, &mut ctx, "b");
        assert!(coord.state.group_decision.is_some());

        coord.resolve_group_decision(GroupDecisionChoice::Retry, &mut ctx);
        assert!(coord.state.group_decision.is_none());
        assert!(!coord.state.failed_tasks.contains("b"));
        assert_ne!(coord.state.task_to_instance["b"].instance_id, failed_instance);
    }

    #[tokio::test]
    async fn test_commit_check_gates_completion() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[])],
        };
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", config(true, true), Some(plan)).unwrap();

        instance_completed(&mut coord, &mut ctx, "a");
        // Completion deferred until the commit count arrives
        assert!(coord.state.awaiting_commit_check.contains("a"));
        assert!(!coord.state.completed_tasks.contains("a"));
        assert!(ctx
            .actions
            .iter()
            .any(|a| matches!(a, DeferredAction::CommitCheck { task_id, .. } if task_id == "a")));

        coord.on_commit_check("a", 2, &mut ctx);
        assert!(coord.state.completed_tasks.contains("a"));
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);
    }

    #[tokio::test]
    async fn test_commit_check_zero_counts_as_failure() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[])],
        };
        let mut cfg = config(true, true);
        cfg.max_task_retries = 1;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();

        let first = coord.state.task_to_instance["a"].instance_id.clone();
        instance_completed(&mut coord, &mut ctx, "a");
        coord.on_commit_check("a", 0, &mut ctx);

        // Retried with a new instance rather than counted complete
        assert!(!coord.state.completed_tasks.contains("a"));
        assert_ne!(coord.state.task_to_instance["a"].instance_id, first);
    }

    #[tokio::test]
    async fn test_review_issues_drive_bounded_revision() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[])],
        };
        let mut cfg = config(true, false);
        cfg.max_revisions = 1;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();
        instance_completed(&mut coord, &mut ctx, "a");
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);

        let report = ReviewReport {
            approved: false,
            issues: vec![ReviewIssue {
                task_id: "a".into(),
                summary: "missing tests".into(),
                detail: String::new(),
            }],
        };
        coord.on_artifact(ArtifactStage::Review, 0, Ok(ArtifactPayload::Review(report.clone())), &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Revision);
        assert_eq!(coord.state.revision.round, 1);
        assert_eq!(coord.state.revision.tasks_to_revise, vec!["a"]);

        // Reviser completes -> back to synthesis
        let reviser = coord.state.revision.reviser_id.clone().unwrap();
        let inst = ctx.orch.session.instance_mut(&reviser).unwrap();
        inst.transition(InstanceStatus::Working).unwrap();
        inst.transition(InstanceStatus::Completed).unwrap();
        coord.on_instance_state_change(&reviser, InstanceStatus::Working, InstanceStatus::Completed, &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);

        // Budget exhausted: issues no longer trigger revision
        coord.on_artifact(ArtifactStage::Review, 0, Ok(ArtifactPayload::Review(report)), &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Consolidating);
    }

    #[tokio::test]
    async fn test_synthesis_approval_gate_without_auto_approve() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let plan = PlanSpec {
            objective: "obj".into(),
            summary: String::new(),
            tasks: vec![task("a", &[])],
        };
        let mut cfg = config(false, false);
        cfg.review = false;
        let mut coord = UltraPlanCoordinator::start(&mut ctx, "obj", cfg, Some(plan)).unwrap();
        coord.approve(&mut ctx); // plan gate
        instance_completed(&mut coord, &mut ctx, "a");

        let report = ReviewReport {
            approved: true,
            issues: vec![],
        };
        coord.on_artifact(ArtifactStage::Review, 0, Ok(ArtifactPayload::Review(report)), &mut ctx);
        // Gate open: stays in Synthesis until the user confirms
        assert_eq!(coord.state.phase, UltraPlanPhase::Synthesis);
        assert!(coord.state.pending_approval);

        coord.approve(&mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Consolidating);
    }

    #[tokio::test]
    async fn test_consolidation_conflict_pause_and_resume() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord =
            UltraPlanCoordinator::start(&mut ctx, "obj", config(true, false), Some(two_layer_plan())).unwrap();
        for t in ["a", "b", "c"] {
            instance_completed(&mut coord, &mut ctx, t);
        }
        let report = ReviewReport {
            approved: true,
            issues: vec![],
        };
        coord.on_artifact(ArtifactStage::Review, 0, Ok(ArtifactPayload::Review(report)), &mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Consolidating);
        assert_eq!(coord.state.consolidation.groups.len(), 1);

        // Walk the machine to the merge step, then inject a conflict
        coord.on_consolidation(ConsolidationOutcome::BranchCreated { group_index: 0 }, &mut ctx);
        coord.on_consolidation(
            ConsolidationOutcome::MergeConflict {
                group_index: 0,
                files: vec!["src/foo.rs".to_string()],
            },
            &mut ctx,
        );
        assert_eq!(coord.state.consolidation.phase, ConsolidationPhase::Paused);
        assert_eq!(coord.state.consolidation.conflict_files, vec!["src/foo.rs"]);

        coord.resume_consolidation(&mut ctx);
        assert_eq!(coord.state.consolidation.phase, ConsolidationPhase::MergingTasks);

        // Finish: three merges, push, PR
        for _ in 0..3 {
            coord.on_consolidation(ConsolidationOutcome::Merged { group_index: 0 }, &mut ctx);
        }
        coord.on_consolidation(ConsolidationOutcome::Pushed { group_index: 0 }, &mut ctx);
        coord.on_consolidation(
            ConsolidationOutcome::PrOpened {
                group_index: 0,
                url: "https://example.com/pr/9".to_string(),
            },
            &mut ctx,
        );
        assert_eq!(coord.state.phase, UltraPlanPhase::Complete);
        assert!(coord.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_stops_everything() {
        let (mut orch, _r, _t) = orchestrator().await;
        let mut ctx = HostCtx::new(&mut orch);
        let mut coord =
            UltraPlanCoordinator::start(&mut ctx, "obj", config(true, false), Some(two_layer_plan())).unwrap();

        coord.cancel(&mut ctx);
        assert_eq!(coord.state.phase, UltraPlanPhase::Failed);
        let stops = ctx
            .actions
            .iter()
            .filter(|a| matches!(a, DeferredAction::Stop(_)))
            .count();
        assert!(stops >= 2, "running task instances were stopped");
    }
}
