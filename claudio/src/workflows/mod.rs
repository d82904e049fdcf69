//! Workflow coordinators - multi-phase pipelines over instances and groups
//!
//! Each coordinator is a phase machine driven from the UI loop: it reacts to
//! instance state changes and parsed artifacts, and expresses side effects
//! through [`HostCtx`]. Coordinators never run background threads; slow work
//! is deferred to the app loop as [`DeferredAction`]s.

mod adversarial;
mod consolidation;
mod multi_plan;
mod triple_shot;
mod ultra_plan;

use std::collections::BTreeSet;
use std::path::PathBuf;

use eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifacts::{ArtifactPayload, ArtifactRequest, ArtifactStage};
use crate::events::Event;
use crate::orchestrator::Orchestrator;
use crate::plan::PlanSpec;
use crate::session::{InstanceGroup, InstanceStatus, SessionType};

pub use adversarial::{AdversarialCoordinator, AdversarialPhase, AdversarialRound, AdversarialSession};
pub use consolidation::{
    ConsolidationGroup, ConsolidationOutcome, ConsolidationPhase, ConsolidationState, ConsolidationStep,
    run_consolidation_step,
};
pub use multi_plan::{MultiPlanCoordinator, MultiPlanPhase, MultiPlanSession};
pub use triple_shot::{TripleShotConfig, TripleShotCoordinator, TripleShotPhase, TripleShotSession};
pub use ultra_plan::{
    ConsolidationMode, GroupDecision, GroupDecisionChoice, RevisionState, TaskBinding, UltraPlanConfig,
    UltraPlanCoordinator, UltraPlanPhase, UltraPlanSession,
};

/// Identifies one live workflow within the app
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkflowKey {
    /// The single active ultra-plan pipeline
    UltraPlan,
    /// A triple-shot, keyed by group id
    TripleShot(String),
    /// An adversarial session, keyed by group id
    Adversarial(String),
    /// A standalone multi-plan competition, keyed by group id
    InlinePlan(String),
}

/// Work a coordinator wants done off the UI loop
#[derive(Debug)]
pub enum DeferredAction {
    /// Stop an instance's session
    Stop(String),
    /// Restart an instance after a failure (task retry path)
    Restart(String),
    /// Count commits ahead of the base branch for a completed task
    CommitCheck {
        workflow: WorkflowKey,
        task_id: String,
        instance_id: String,
        branch: String,
    },
    /// Execute one consolidation step against git
    Consolidation(ConsolidationStep),
    /// Surface an info banner
    Info(String),
    /// Surface an error banner
    Error(String),
}

/// Mutable context handed to coordinators
///
/// Synchronous effects (instance stubs, groups) apply immediately through
/// the orchestrator; anything slow is queued as a [`DeferredAction`] the app
/// loop executes afterwards.
pub struct HostCtx<'a> {
    pub orch: &'a mut Orchestrator,
    pub actions: Vec<DeferredAction>,
}

impl<'a> HostCtx<'a> {
    pub fn new(orch: &'a mut Orchestrator) -> Self {
        Self {
            orch,
            actions: Vec::new(),
        }
    }

    /// Create an instance stub for a workflow task; it starts as soon as its
    /// worktree is provisioned
    pub fn spawn_instance(&mut self, task: &str, group: Option<&str>) -> Result<String> {
        let id = self.orch.add_instance(task)?;
        self.orch.queue_start(&id);
        if let Some(group_id) = group {
            if let Some(group) = self.orch.session.group_mut(group_id) {
                group.add_instance(&id);
            }
        }
        debug!(%id, ?group, "HostCtx::spawn_instance");
        Ok(id)
    }

    /// Create a group and return its id
    pub fn create_group(&mut self, name: &str, session_type: SessionType, objective: &str) -> String {
        let group = InstanceGroup::new(name, session_type, objective);
        let id = group.id.clone();
        self.orch.session.add_group(group);
        id
    }

    pub fn status(&self, id: &str) -> Option<InstanceStatus> {
        self.orch.session.instance_status(id)
    }

    pub fn worktree_of(&self, id: &str) -> Option<PathBuf> {
        self.orch.session.instance(id).map(|i| i.worktree_path.clone())
    }

    pub fn branch_of(&self, id: &str) -> Option<String> {
        self.orch.session.instance(id).map(|i| i.branch.clone())
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.orch.config().git.worktree_dir.clone()
    }

    pub fn main_branch(&self) -> String {
        self.orch.main_branch().to_string()
    }

    pub fn stop_instance(&mut self, id: &str) {
        self.actions.push(DeferredAction::Stop(id.to_string()));
    }

    pub fn restart_instance(&mut self, id: &str) {
        self.actions.push(DeferredAction::Restart(id.to_string()));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.actions.push(DeferredAction::Info(message.into()));
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.actions.push(DeferredAction::Error(message.into()));
    }

    pub fn publish(&self, event: Event) {
        self.orch.bus().publish(event);
    }

    /// Queue a verified-commit count for a task's branch
    pub fn request_commit_check(&mut self, workflow: WorkflowKey, task_id: &str, instance_id: &str) {
        let Some(branch) = self.branch_of(instance_id) else {
            warn!(%instance_id, "request_commit_check: unknown instance");
            return;
        };
        self.actions.push(DeferredAction::CommitCheck {
            workflow,
            task_id: task_id.to_string(),
            instance_id: instance_id.to_string(),
            branch,
        });
    }

    pub fn request_consolidation(&mut self, step: ConsolidationStep) {
        self.actions.push(DeferredAction::Consolidation(step));
    }
}

/// Common coordinator interface
///
/// One variant per workflow; the app loop drives them uniformly through
/// this trait and falls back to the concrete type for workflow-specific
/// operations (plan approval, group decisions, consolidation resume).
pub trait Coordinator {
    fn key(&self) -> WorkflowKey;

    /// Phase label for the status line
    fn display_phase(&self) -> String;

    /// Complete or Failed
    fn is_terminal(&self) -> bool;

    /// Periodic housekeeping on the UI tick
    fn tick(&mut self, ctx: &mut HostCtx);

    /// An instance transitioned; coordinators ignore instances that are not
    /// theirs
    fn on_instance_state_change(&mut self, id: &str, old: InstanceStatus, new: InstanceStatus, ctx: &mut HostCtx);

    /// A polled artifact parsed (Ok) or failed to parse (Err); not-ready
    /// polls are never delivered
    fn on_artifact(&mut self, stage: ArtifactStage, index: usize, result: Result<ArtifactPayload, String>, ctx: &mut HostCtx);

    /// Artifacts this coordinator is currently waiting on
    fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest>;

    /// Abandon the workflow; stops its instances and ends in Failed
    fn cancel(&mut self, ctx: &mut HostCtx);
}

/// A plan produced by one strategy planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePlan {
    pub strategy: String,
    pub plan: PlanSpec,
}

/// Planner strategies used for multi-pass planning, in spawn order
pub const PLANNER_STRATEGIES: &[&str] = &["incremental", "parallel", "risk-first"];

/// Shared planning mechanics for multi-planner competitions
///
/// Used by the standalone multi-plan workflow and by ultra-plan's
/// multi-pass planning phase: N strategy planners produce candidate plans,
/// failures are tolerated, and the pool reports when every planner has
/// produced-or-failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlannerPool {
    pub planner_ids: Vec<String>,
    pub strategies: Vec<String>,
    /// Planner indices that have produced-or-failed (idempotence set)
    pub processed: BTreeSet<usize>,
    /// Planner indices whose artifact was invalid or whose instance died
    pub failed: BTreeSet<usize>,
    pub candidates: Vec<CandidatePlan>,
}

impl PlannerPool {
    /// Spawn one planner instance per strategy into `group`
    pub fn spawn(ctx: &mut HostCtx, objective: &str, group: &str, strategies: &[&str]) -> Result<Self> {
        let mut pool = Self {
            strategies: strategies.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        for &strategy in strategies {
            let prompt = build_planner_prompt(objective, Some(strategy));
            let id = ctx.spawn_instance(&prompt, Some(group))?;
            pool.planner_ids.push(id);
        }
        Ok(pool)
    }

    /// Index of a planner instance id
    pub fn index_of(&self, instance_id: &str) -> Option<usize> {
        self.planner_ids.iter().position(|id| id == instance_id)
    }

    /// Record one planner's outcome; duplicate deliveries are ignored
    pub fn record(&mut self, index: usize, result: Result<PlanSpec, String>) {
        if index >= self.planner_ids.len() || !self.processed.insert(index) {
            return;
        }
        match result {
            Ok(plan) => {
                let strategy = self.strategies.get(index).cloned().unwrap_or_default();
                self.candidates.push(CandidatePlan { strategy, plan });
            }
            Err(reason) => {
                debug!(index, %reason, "PlannerPool::record: planner failed");
                self.failed.insert(index);
            }
        }
    }

    /// Every planner has produced-or-failed
    pub fn all_processed(&self) -> bool {
        self.processed.len() >= self.planner_ids.len()
    }

    /// Artifact polls for planners not yet processed
    pub fn pending_artifacts(&self, orch: &Orchestrator) -> Vec<ArtifactRequest> {
        self.planner_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.processed.contains(i))
            .filter_map(|(i, id)| {
                let inst = orch.session.instance(id)?;
                inst.worktree_ready.then(|| ArtifactRequest {
                    stage: ArtifactStage::Plan,
                    index: i,
                    worktree: inst.worktree_path.clone(),
                })
            })
            .collect()
    }
}

/// Resolve a plan-manager decision against the candidate set
///
/// Select must name a valid candidate; a merged plan must validate and may
/// only contain tasks drawn from the candidates (select-or-merge keeps the
/// final task set a subset of the candidate union).
pub fn resolve_decision(
    candidates: &[CandidatePlan],
    decision: crate::artifacts::PlanDecision,
) -> Result<PlanSpec, String> {
    use crate::artifacts::DecisionAction;

    match decision.action {
        DecisionAction::Select => {
            let index = decision.selected.ok_or("select decision names no candidate")?;
            let candidate = candidates
                .get(index)
                .ok_or_else(|| format!("selected candidate {} does not exist", index))?;
            Ok(candidate.plan.clone())
        }
        DecisionAction::Merge => {
            let plan = decision.plan;
            plan.validate().map_err(|e| e.to_string())?;
            let union: std::collections::HashSet<&str> = candidates
                .iter()
                .flat_map(|c| c.plan.tasks.iter().map(|t| t.id.as_str()))
                .collect();
            for task in &plan.tasks {
                if !union.contains(task.id.as_str()) {
                    return Err(format!("merged plan invents task {} not present in any candidate", task.id));
                }
            }
            Ok(plan)
        }
    }
}

// === Prompt builders ===
//
// Agents receive their whole briefing as the task text; artifacts come back
// through the fixed .claudio/ paths.

pub fn build_planner_prompt(objective: &str, strategy: Option<&str>) -> String {
    let angle = match strategy {
        Some("incremental") => "Favor small, independently shippable tasks with a strict ordering.\n",
        Some("parallel") => "Maximize the number of tasks that can run concurrently; minimize dependencies.\n",
        Some("risk-first") => "Front-load the riskiest and most uncertain work into the earliest tasks.\n",
        _ => "",
    };
    format!(
        "Decompose the following objective into an executable task plan.\n\
         {angle}\
         Objective: {objective}\n\n\
         Write the plan as YAML to .claudio/plan.yaml with fields: objective, summary, \
         tasks (each with id, title, description, files, depends_on, priority, complexity: low|medium|high). \
         Task ids must be unique and depends_on must reference existing task ids without cycles."
    )
}

pub fn build_evaluator_prompt(objective: &str, candidates: &[CandidatePlan]) -> String {
    let mut prompt = format!(
        "You are evaluating candidate plans for this objective:\n{objective}\n\n\
         Candidate plans follow, each produced by a different strategy.\n\n"
    );
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "--- candidate {} (strategy: {}) ---\n{}\n\n",
            i,
            candidate.strategy,
            serde_yaml::to_string(&candidate.plan).unwrap_or_default()
        ));
    }
    prompt.push_str(
        "Pick the strongest plan or merge the best parts of several. Write the result as YAML to \
         .claudio/plan.yaml. Include `action: select` with `selected: <candidate index>` if you picked one \
         unchanged, or `action: merge` with the full merged plan (objective, summary, tasks). Merged plans \
         may only contain tasks taken from the candidates.",
    );
    prompt
}

pub fn build_task_prompt(objective: &str, task_id: &str, title: &str, description: &str, files: &[String]) -> String {
    let files_note = if files.is_empty() {
        String::new()
    } else {
        format!("Files in scope: {}\n", files.join(", "))
    };
    format!(
        "You are executing task {task_id} of a larger plan.\n\
         Overall objective: {objective}\n\n\
         Task: {title}\n{description}\n{files_note}\n\
         Commit your work when done."
    )
}

pub fn build_synthesis_prompt(objective: &str, branches: &[(String, String)]) -> String {
    let mut prompt = format!(
        "Review the combined result of a multi-task plan.\n\
         Objective: {objective}\n\nTask branches to inspect:\n"
    );
    for (task_id, branch) in branches {
        prompt.push_str(&format!("  - {} on branch {}\n", task_id, branch));
    }
    prompt.push_str(
        "\nInspect the aggregate diff across these branches. Write your verdict as YAML to \
         .claudio/review.yaml with fields: approved (bool), issues (list of {task_id, summary, detail}). \
         Approve only if the combined changes satisfy the objective.",
    );
    prompt
}

pub fn build_reviser_prompt(objective: &str, issues: &[(String, String)]) -> String {
    let mut prompt = format!(
        "A review of the plan execution found issues. Fix them.\n\
         Objective: {objective}\n\nIssues:\n"
    );
    for (task_id, summary) in issues {
        prompt.push_str(&format!("  - [{}] {}\n", task_id, summary));
    }
    prompt.push_str("\nApply the fixes and commit your work.");
    prompt
}

pub fn build_judge_prompt(task: &str, attempts: &[(String, String)]) -> String {
    let mut prompt = format!(
        "Three independent attempts were made at the same task.\n\
         Task: {task}\n\nAttempts:\n"
    );
    for (id, branch) in attempts {
        prompt.push_str(&format!("  - attempt {} on branch {}\n", id, branch));
    }
    prompt.push_str(
        "\nCompare the diffs and pick the best attempt. Write YAML to .claudio/triple-shot/result.yaml \
         with fields: winner (the attempt id), reasoning.",
    );
    prompt
}

pub fn build_generator_prompt(task: &str, round: u32, previous_issues: &[String]) -> String {
    if previous_issues.is_empty() {
        format!("Implement the following task. Commit your work.\nTask: {task}")
    } else {
        let issues = previous_issues
            .iter()
            .map(|i| format!("  - {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Round {round}: a critic found problems with the previous attempt at this task.\n\
             Task: {task}\n\nIssues to address:\n{issues}\n\nFix them and commit your work."
        )
    }
}

pub fn build_critic_prompt(task: &str, branch: &str, round: u32) -> String {
    format!(
        "You are an adversarial critic. Attack the implementation on branch {branch}.\n\
         Task it claims to solve: {task}\n\n\
         Hunt for bugs, missed requirements, and weak spots. Write YAML to \
         .claudio/adversarial/round-{round}/critique.yaml with fields: verdict (approve|revise), \
         issues (list of strings). Approve only if you cannot find a substantive problem."
    )
}
