//! App loop - the single mutator
//!
//! One tick (~100 ms) pulls output and state from every capture worker,
//! routes events into coordinators, dispatches artifact polls and git
//! steps to background tasks, and applies their results when they come
//! back as messages. Nothing else mutates the model or the session.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::artifacts::{self, ArtifactError, ArtifactPayload, ArtifactRequest};
use crate::config::Config;
use crate::driver::SessionSpec;
use crate::events::{Event, Subscription, Topic};
use crate::instance::{InstanceManager, TimeoutPolicy};
use crate::orchestrator::{Orchestrator, OrchestratorMsg, StateChange};
use crate::plan::PlanSpec;
use crate::session::{InstanceStatus, save_session};
use crate::workflows::{
    AdversarialCoordinator, ConsolidationOutcome, Coordinator, DeferredAction, HostCtx, MultiPlanCoordinator,
    MultiPlanPhase, TripleShotConfig, TripleShotCoordinator, UltraPlanConfig, UltraPlanCoordinator, UltraPlanPhase,
    WorkflowKey, run_consolidation_step,
};

use super::events::{Event as UiEvent, EventHandler};
use super::model::{
    InstanceOp, InstanceRow, KeyPress, KeySend, KeyTarget, Mode, Model, PlanEditorState, WorkflowRequest,
};
use super::{input, views};

/// Ticks between session snapshots (~5 s at the default tick rate)
const SAVE_EVERY_TICKS: u64 = 50;

/// Result of one artifact poll
#[derive(Debug)]
pub enum ArtifactOutcome {
    Ready(ArtifactPayload),
    Failed(String),
    /// File missing or empty; poll again next tick
    NotReady,
}

/// Background-task results delivered to the app loop
#[derive(Debug)]
pub enum AppMessage {
    Artifact {
        key: WorkflowKey,
        request: ArtifactRequest,
        outcome: ArtifactOutcome,
    },
    CommitCheck {
        key: WorkflowKey,
        task_id: String,
        result: Result<u32, String>,
    },
    Consolidation(ConsolidationOutcome),
}

/// The tick-driven update loop
pub struct AppLoop {
    config: Config,
    orch: Orchestrator,
    model: Model,

    ultra: Option<UltraPlanCoordinator>,
    triple_shots: HashMap<String, TripleShotCoordinator>,
    adversarials: HashMap<String, AdversarialCoordinator>,
    inline_plans: HashMap<String, MultiPlanCoordinator>,

    orch_rx: mpsc::UnboundedReceiver<OrchestratorMsg>,
    msg_tx: mpsc::UnboundedSender<AppMessage>,
    msg_rx: mpsc::UnboundedReceiver<AppMessage>,

    timeout_sub: Subscription,
    bell_sub: Subscription,
    pr_completed_sub: Subscription,
    pr_opened_sub: Subscription,

    /// Artifact polls already dispatched and not yet answered
    inflight: HashSet<(WorkflowKey, ArtifactRequest)>,
    /// Instances whose stream already produced a PR-opened event
    pr_seen: HashSet<String>,
    /// PR display state; workflow-driven completion wins over stream detection
    pr_done: HashSet<String>,
    /// Inline plans already surfaced to the plan editor
    surfaced_plans: HashSet<String>,
    /// Triple-shots already chained into an adversarial follow-up
    chained_followups: HashSet<String>,
    /// Why the plan editor is open
    plan_editor_source: Option<WorkflowKey>,

    side_terminal: Option<InstanceManager>,
    session_path: PathBuf,
    tick_count: u64,
}

impl AppLoop {
    /// Build the loop around an orchestrator, restoring coordinators from
    /// the loaded session
    pub fn new(orch: Orchestrator, config: Config, session_path: PathBuf, orch_rx: mpsc::UnboundedReceiver<OrchestratorMsg>) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let bus = orch.bus();

        let ultra = orch.session.ultra_plan.clone().map(UltraPlanCoordinator::from_state);
        let triple_shots = orch
            .session
            .triple_shots
            .iter()
            .map(|s| (s.group_id.clone(), TripleShotCoordinator::from_state(s.clone())))
            .collect();
        let adversarials = orch
            .session
            .adversarials
            .iter()
            .map(|s| (s.group_id.clone(), AdversarialCoordinator::from_state(s.clone())))
            .collect();
        let inline_plans = orch
            .session
            .inline_plans
            .iter()
            .map(|s| (s.group_id.clone(), MultiPlanCoordinator::from_state(s.clone())))
            .collect();

        let model = Model::new(Duration::from_secs(config.ui.message_ttl_secs));

        Self {
            timeout_sub: bus.subscribe(Topic::InstanceTimeout),
            bell_sub: bus.subscribe(Topic::InstanceBell),
            pr_completed_sub: bus.subscribe(Topic::PrCompleted),
            pr_opened_sub: bus.subscribe(Topic::PrOpened),
            config,
            orch,
            model,
            ultra,
            triple_shots,
            adversarials,
            inline_plans,
            orch_rx,
            msg_tx,
            msg_rx,
            inflight: HashSet::new(),
            pr_seen: HashSet::new(),
            pr_done: HashSet::new(),
            surfaced_plans: HashSet::new(),
            chained_followups: HashSet::new(),
            plan_editor_source: None,
            side_terminal: None,
            session_path,
            tick_count: 0,
        }
    }

    /// Read access for tests
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orch
    }

    /// Run until quit; `shutdown_rx` carries signal-initiated shutdown
    pub async fn run(&mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        info!("App loop starting");
        let mut terminal = ratatui::init();
        let mut events = EventHandler::new(Duration::from_millis(self.config.ui.tick_ms));

        let result = loop {
            if let Err(e) = terminal.draw(|frame| views::render(&mut self.model, frame)) {
                break Err(eyre::eyre!("render failed: {}", e));
            }

            tokio::select! {
                event = events.next() => match event {
                    Ok(UiEvent::Tick) => {
                        if let Err(e) = self.handle_tick().await {
                            warn!(error = %e, "tick failed");
                        }
                    }
                    Ok(UiEvent::Key(key)) => self.handle_key(key),
                    Ok(UiEvent::Mouse(mouse)) => self.handle_mouse(mouse),
                    Ok(UiEvent::Resize(w, h)) => {
                        self.orch.resize_all(w.saturating_sub(34), h.saturating_sub(4)).await;
                    }
                    Err(e) => break Err(e),
                },
                Some(msg) = self.orch_rx.recv() => self.handle_orch_msg(msg).await,
                Some(msg) = self.msg_rx.recv() => self.handle_app_msg(msg).await,
                Some(()) = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    self.model.should_quit = true;
                }
            }

            if self.model.should_quit {
                break Ok(());
            }
        };

        ratatui::restore();
        self.shutdown().await;
        result
    }

    /// Persist state and release everything
    async fn shutdown(&mut self) {
        info!("App loop shutting down");
        self.sync_workflows_into_session();
        if let Err(e) = save_session(&self.session_path, &self.orch.session) {
            warn!(error = %e, "failed to persist session on shutdown");
        }
        if let Some(mut terminal) = self.side_terminal.take() {
            terminal.stop().await;
        }
        self.orch.shutdown().await;
    }

    fn handle_key(&mut self, key: crossterm::event::KeyEvent) {
        let view = self.model.view(
            self.ultra.as_ref().is_some_and(|u| !u.is_terminal()),
            self.ultra.as_ref().is_some_and(|u| {
                u.state.consolidation.phase == crate::workflows::ConsolidationPhase::Paused
            }),
        );
        input::handle_key(&mut self.model, &view, key);
    }

    fn handle_mouse(&mut self, mouse: crossterm::event::MouseEvent) {
        use crossterm::event::MouseEventKind;
        let height = self.model.output_height;
        let Some(id) = self.model.active_instance_id() else { return };
        match mouse.kind {
            MouseEventKind::ScrollUp => self.model.outputs.scroll_up(&id, 3),
            MouseEventKind::ScrollDown => self.model.outputs.scroll_down(&id, 3, height),
            _ => {}
        }
    }

    // === Tick ===

    async fn handle_tick(&mut self) -> Result<()> {
        self.tick_count += 1;
        debug!(tick = self.tick_count, "handle_tick");

        // (a) pull output and reconcile instance state
        self.pull_outputs();
        let changes = self.orch.pull_states();
        if !changes.is_empty() {
            let actions = self.dispatch_state_changes(&changes);
            self.apply_actions(actions).await;
        }
        self.detect_pr_urls();

        // (b) side terminal refresh
        if self.model.show_terminal {
            self.ensure_side_terminal().await;
            if let Some(terminal) = &self.side_terminal {
                self.model.terminal_output = terminal.output();
            }
        }

        // (c) bus events (timeouts, bells, PR notifications)
        self.drain_bus_events().await;

        // (d) transient banners past their TTL
        self.model.dismiss_stale_messages();

        // (e) artifact pollers for active workflows
        self.dispatch_artifact_polls();

        // (f) user requests recorded by the input layer
        self.process_model_requests().await;

        // Workflow housekeeping
        self.surface_completed_plans();
        self.chain_adversarial_followups().await;
        let actions = self.tick_coordinators();
        self.apply_actions(actions).await;

        // Fleet housekeeping
        self.orch.process_auto_start().await;
        self.orch.dispatch_conflict_scan();
        self.model.conflicts = self.orch.conflicts().to_vec();
        if self.model.show_stats {
            self.model.stats = Some(self.orch.session_metrics());
        }
        self.model.workflow_status = self.workflow_status_line();
        self.sync_instance_rows();

        if self.tick_count % SAVE_EVERY_TICKS == 0 {
            self.sync_workflows_into_session();
            if let Err(e) = save_session(&self.session_path, &self.orch.session) {
                warn!(error = %e, "periodic session save failed");
            }
        }
        Ok(())
    }

    fn pull_outputs(&mut self) {
        let active = self.model.active_instance_id();
        let height = self.model.output_height;
        let overlay_open = self.model.show_help || self.model.show_stats || self.model.show_conflicts;

        let ids = self.orch.manager_ids();
        let mut changed_active = false;
        for id in ids {
            let Some(manager) = self.orch.manager(&id) else { continue };
            let text = manager.output();
            let visible = !overlay_open && active.as_deref() == Some(id.as_str());
            let grew = self.model.outputs.update_output(&id, &text, height, visible);
            if grew && visible {
                changed_active = true;
            }
        }
        if changed_active {
            self.model.rescan_search();
        }
    }

    /// Publish a PR-opened event the first time a PR URL shows up in an
    /// instance's stream
    fn detect_pr_urls(&mut self) {
        let bus = self.orch.bus();
        for inst in &self.orch.session.instances {
            if self.pr_seen.contains(&inst.id) {
                continue;
            }
            let Some(state) = self.model.outputs.state(&inst.id) else { continue };
            let has_pr = state
                .text
                .lines()
                .rev()
                .take(40)
                .any(|l| l.contains("github.com/") && l.contains("/pull/"));
            if has_pr {
                self.pr_seen.insert(inst.id.clone());
                bus.publish(Event::PrOpened {
                    instance_id: inst.id.clone(),
                });
            }
        }
    }

    async fn drain_bus_events(&mut self) {
        let mut actions = Vec::new();

        while let Ok(event) = self.timeout_sub.rx.try_recv() {
            if let Event::InstanceTimeout { instance_id, kind } = event {
                if let Some(change) = self.orch.apply_timeout(&instance_id, kind) {
                    let label = match change.new {
                        InstanceStatus::Stuck => "stuck (stale output)",
                        _ => "timed out",
                    };
                    self.model.set_error(format!(
                        "Instance {} {} - Ctrl+R to restart, Ctrl+X to kill",
                        instance_id, label
                    ));
                    actions.extend(self.dispatch_state_changes(&[change]));
                }
            }
        }

        while let Ok(event) = self.bell_sub.rx.try_recv() {
            if let Event::InstanceBell { instance_id } = event {
                self.model.set_info(format!("Bell from {}", instance_id));
            }
        }

        // Ordering rule: PrCompleted is workflow-driven truth and wins;
        // a PrOpened arriving after it is ignored for status display.
        while let Ok(event) = self.pr_completed_sub.rx.try_recv() {
            if let Event::PrCompleted { instance_id, success } = event {
                self.pr_done.insert(instance_id.clone());
                if success {
                    self.model.set_info(format!("PR completed for {}", instance_id));
                } else {
                    self.model.set_error(format!("PR failed for {}", instance_id));
                }
            }
        }
        while let Ok(event) = self.pr_opened_sub.rx.try_recv() {
            if let Event::PrOpened { instance_id } = event {
                if !self.pr_done.contains(&instance_id) {
                    self.model.set_info(format!("PR opened by {}", instance_id));
                }
            }
        }

        self.apply_actions(actions).await;
    }

    // === Coordinator dispatch ===

    fn dispatch_state_changes(&mut self, changes: &[StateChange]) -> Vec<DeferredAction> {
        let mut ctx = HostCtx::new(&mut self.orch);
        for change in changes {
            let (id, old, new) = (&change.instance_id, change.old, change.new);
            if let Some(ultra) = self.ultra.as_mut() {
                ultra.on_instance_state_change(id, old, new, &mut ctx);
            }
            for coordinator in self.triple_shots.values_mut() {
                coordinator.on_instance_state_change(id, old, new, &mut ctx);
            }
            for coordinator in self.adversarials.values_mut() {
                coordinator.on_instance_state_change(id, old, new, &mut ctx);
            }
            for coordinator in self.inline_plans.values_mut() {
                coordinator.on_instance_state_change(id, old, new, &mut ctx);
            }
        }
        ctx.actions
    }

    fn tick_coordinators(&mut self) -> Vec<DeferredAction> {
        let mut ctx = HostCtx::new(&mut self.orch);
        if let Some(ultra) = self.ultra.as_mut() {
            ultra.tick(&mut ctx);
            // An open plan gate surfaces the plan editor exactly once
            if ultra.state.phase == UltraPlanPhase::Refresh
                && ultra.state.pending_approval
                && self.model.plan_editor.is_none()
                && self.plan_editor_source.is_none()
            {
                if let Some(plan) = ultra.state.plan.clone() {
                    self.model.plan_editor = Some(PlanEditorState { plan, selected: 0 });
                    self.model.mode = Mode::PlanEditor;
                    self.plan_editor_source = Some(WorkflowKey::UltraPlan);
                }
            }
        }
        for coordinator in self.triple_shots.values_mut() {
            coordinator.tick(&mut ctx);
        }
        for coordinator in self.adversarials.values_mut() {
            coordinator.tick(&mut ctx);
        }
        for coordinator in self.inline_plans.values_mut() {
            coordinator.tick(&mut ctx);
        }
        ctx.actions
    }

    /// Surface finished inline multi-plans to the plan editor
    fn surface_completed_plans(&mut self) {
        let mut to_surface = None;
        for (group_id, coordinator) in &self.inline_plans {
            if coordinator.state.phase == MultiPlanPhase::Complete
                && !self.surfaced_plans.contains(group_id)
                && coordinator.state.selected_plan.is_some()
            {
                to_surface = Some((group_id.clone(), coordinator.state.selected_plan.clone().unwrap()));
                break;
            }
        }
        if let Some((group_id, plan)) = to_surface {
            self.surfaced_plans.insert(group_id.clone());
            if self.model.plan_editor.is_none() {
                self.model.plan_editor = Some(PlanEditorState { plan, selected: 0 });
                self.model.mode = Mode::PlanEditor;
                self.plan_editor_source = Some(WorkflowKey::InlinePlan(group_id));
            }
        }
    }

    /// Start adversarial rounds on the winner of a finished triple-shot
    /// configured for it
    async fn chain_adversarial_followups(&mut self) {
        let mut chains = Vec::new();
        for (group_id, coordinator) in &self.triple_shots {
            if coordinator.wants_adversarial_followup() && !self.chained_followups.contains(group_id) {
                chains.push((group_id.clone(), coordinator.state.task.clone()));
            }
        }
        for (group_id, task) in chains {
            self.chained_followups.insert(group_id);
            let max_rounds = self.config.workflows.max_adversarial_rounds;
            let mut ctx = HostCtx::new(&mut self.orch);
            match AdversarialCoordinator::start(&mut ctx, &task, max_rounds) {
                Ok(coordinator) => {
                    let key = coordinator.state.group_id.clone();
                    self.adversarials.insert(key, coordinator);
                }
                Err(e) => self.model.set_error(format!("Failed to chain adversarial: {}", e)),
            }
            let actions = ctx.actions;
            self.apply_actions(actions).await;
        }
    }

    // === Artifact polls ===

    fn dispatch_artifact_polls(&mut self) {
        let mut wanted: Vec<(WorkflowKey, ArtifactRequest)> = Vec::new();
        if let Some(ultra) = &self.ultra {
            if !ultra.is_terminal() {
                wanted.extend(ultra.pending_artifacts(&self.orch).into_iter().map(|r| (ultra.key(), r)));
            }
        }
        for coordinator in self.triple_shots.values().filter(|c| !c.is_terminal()) {
            wanted.extend(
                coordinator
                    .pending_artifacts(&self.orch)
                    .into_iter()
                    .map(|r| (coordinator.key(), r)),
            );
        }
        for coordinator in self.adversarials.values().filter(|c| !c.is_terminal()) {
            wanted.extend(
                coordinator
                    .pending_artifacts(&self.orch)
                    .into_iter()
                    .map(|r| (coordinator.key(), r)),
            );
        }
        for coordinator in self.inline_plans.values().filter(|c| !c.is_terminal()) {
            wanted.extend(
                coordinator
                    .pending_artifacts(&self.orch)
                    .into_iter()
                    .map(|r| (coordinator.key(), r)),
            );
        }

        for (key, request) in wanted {
            if !self.inflight.insert((key.clone(), request.clone())) {
                continue;
            }
            let tx = self.msg_tx.clone();
            tokio::spawn(async move {
                let outcome = match artifacts::poll(&request).await {
                    Ok(payload) => ArtifactOutcome::Ready(payload),
                    Err(ArtifactError::NotReady) => ArtifactOutcome::NotReady,
                    Err(e) => ArtifactOutcome::Failed(e.to_string()),
                };
                let _ = tx.send(AppMessage::Artifact { key, request, outcome });
            });
        }
    }

    // === Message handlers ===

    async fn handle_orch_msg(&mut self, msg: OrchestratorMsg) {
        match msg {
            OrchestratorMsg::WorktreeReady { instance_id } => {
                self.orch.on_worktree_ready(&instance_id).await;
            }
            OrchestratorMsg::WorktreeFailed { instance_id, error } => {
                self.orch.on_worktree_failed(&instance_id, &error);
                self.model.set_error(format!("Worktree setup failed for {}: {}", instance_id, error));
                // Coordinators see the failure as a normal terminal transition
                let change = StateChange {
                    instance_id,
                    old: InstanceStatus::Pending,
                    new: InstanceStatus::Error,
                };
                let actions = self.dispatch_state_changes(&[change]);
                self.apply_actions(actions).await;
            }
            OrchestratorMsg::Branches(result) => match result {
                Ok(branches) => {
                    self.model.set_info(format!("{} branches", branches.len()));
                    self.model.branches = branches;
                }
                Err(e) => self.model.set_error(format!("Branch listing failed: {}", e)),
            },
            OrchestratorMsg::Conflicts(conflicts) => {
                self.orch.set_conflicts(conflicts);
            }
        }
    }

    async fn handle_app_msg(&mut self, msg: AppMessage) {
        match msg {
            AppMessage::Artifact { key, request, outcome } => {
                self.inflight.remove(&(key.clone(), request.clone()));
                let result = match outcome {
                    ArtifactOutcome::NotReady => return,
                    ArtifactOutcome::Ready(payload) => Ok(payload),
                    ArtifactOutcome::Failed(reason) => Err(reason),
                };

                let mut ctx = HostCtx::new(&mut self.orch);
                match &key {
                    WorkflowKey::UltraPlan => {
                        if let Some(ultra) = self.ultra.as_mut() {
                            ultra.on_artifact(request.stage, request.index, result, &mut ctx);
                        }
                    }
                    WorkflowKey::TripleShot(group) => {
                        if let Some(coordinator) = self.triple_shots.get_mut(group) {
                            coordinator.on_artifact(request.stage, request.index, result, &mut ctx);
                        }
                    }
                    WorkflowKey::Adversarial(group) => {
                        if let Some(coordinator) = self.adversarials.get_mut(group) {
                            coordinator.on_artifact(request.stage, request.index, result, &mut ctx);
                        }
                    }
                    WorkflowKey::InlinePlan(group) => {
                        if let Some(coordinator) = self.inline_plans.get_mut(group) {
                            coordinator.on_artifact(request.stage, request.index, result, &mut ctx);
                        }
                    }
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            AppMessage::CommitCheck { key, task_id, result } => {
                if key != WorkflowKey::UltraPlan {
                    return;
                }
                let commits = match result {
                    Ok(count) => count,
                    Err(e) => {
                        self.model.set_error(format!("Commit check failed for {}: {}", task_id, e));
                        0
                    }
                };
                let mut ctx = HostCtx::new(&mut self.orch);
                if let Some(ultra) = self.ultra.as_mut() {
                    ultra.on_commit_check(&task_id, commits, &mut ctx);
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            AppMessage::Consolidation(outcome) => {
                let mut ctx = HostCtx::new(&mut self.orch);
                if let Some(ultra) = self.ultra.as_mut() {
                    ultra.on_consolidation(outcome, &mut ctx);
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
        }
    }

    // === Deferred actions ===

    async fn apply_actions(&mut self, actions: Vec<DeferredAction>) {
        for action in actions {
            match action {
                DeferredAction::Stop(id) => self.orch.stop_instance(&id).await,
                DeferredAction::Restart(id) => {
                    if let Err(e) = self.orch.restart_instance(&id).await {
                        warn!(%id, error = %e, "deferred restart failed");
                    }
                }
                DeferredAction::Info(message) => self.model.set_info(message),
                DeferredAction::Error(message) => self.model.set_error(message),
                DeferredAction::CommitCheck {
                    workflow,
                    task_id,
                    branch,
                    ..
                } => {
                    let git = self.orch.git().clone();
                    let base = self.orch.main_branch().to_string();
                    let tx = self.msg_tx.clone();
                    tokio::spawn(async move {
                        let result = git.commits_ahead(&branch, &base).await.map_err(|e| e.to_string());
                        let _ = tx.send(AppMessage::CommitCheck {
                            key: workflow,
                            task_id,
                            result,
                        });
                    });
                }
                DeferredAction::Consolidation(step) => {
                    let git = self.orch.git().clone();
                    let tx = self.msg_tx.clone();
                    tokio::spawn(async move {
                        let outcome = run_consolidation_step(&git, step).await;
                        let _ = tx.send(AppMessage::Consolidation(outcome));
                    });
                }
            }
        }
    }

    // === Model requests ===

    async fn process_model_requests(&mut self) {
        // Forwarded keystrokes
        for send in std::mem::take(&mut self.model.pending_keys) {
            self.deliver_key(send).await;
        }

        if let Some(task) = self.model.pending_new_task.take() {
            match self.orch.add_instance(&task) {
                Ok(id) => self.model.set_info(format!("Instance {} added", id)),
                Err(e) => self.model.set_error(format!("Failed to add task: {}", e)),
            }
        }

        if let Some(request) = self.model.pending_workflow.take() {
            self.start_workflow(request).await;
        }

        if let Some(op) = self.model.pending_instance_op.take() {
            self.run_instance_op(op).await;
        }

        if self.model.pending_approve {
            self.model.pending_approve = false;
            self.handle_approve().await;
        }

        if self.model.pending_plan_cancel {
            self.model.pending_plan_cancel = false;
            self.model.plan_editor = None;
            let source = self.plan_editor_source.take();
            if source == Some(WorkflowKey::UltraPlan) {
                let mut ctx = HostCtx::new(&mut self.orch);
                if let Some(ultra) = self.ultra.as_mut() {
                    ultra.plan_editing_cancelled(&mut ctx);
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
        }

        if self.model.pending_resume_consolidation {
            self.model.pending_resume_consolidation = false;
            let mut ctx = HostCtx::new(&mut self.orch);
            if let Some(ultra) = self.ultra.as_mut() {
                ultra.resume_consolidation(&mut ctx);
            }
            let actions = ctx.actions;
            self.apply_actions(actions).await;
        }

        if let Some(choice) = self.model.pending_group_decision.take() {
            let mut ctx = HostCtx::new(&mut self.orch);
            if let Some(ultra) = self.ultra.as_mut() {
                ultra.resolve_group_decision(choice, &mut ctx);
            }
            let actions = ctx.actions;
            self.apply_actions(actions).await;
        }

        if self.model.pending_branch_list {
            self.model.pending_branch_list = false;
            self.orch.list_branches_async();
        }
    }

    async fn deliver_key(&mut self, send: KeySend) {
        match send.target {
            KeyTarget::Instance(id) => {
                let Some(manager) = self.orch.manager(&id) else { return };
                match send.press {
                    KeyPress::Named(key) => manager.send_key(&key).await,
                    KeyPress::Literal(text) => manager.send_literal(&text).await,
                    KeyPress::Paste(text) => manager.send_paste(&text).await,
                }
            }
            KeyTarget::SideTerminal => {
                self.ensure_side_terminal().await;
                let Some(terminal) = &self.side_terminal else { return };
                match send.press {
                    KeyPress::Named(key) => terminal.send_key(&key).await,
                    KeyPress::Literal(text) => terminal.send_literal(&text).await,
                    KeyPress::Paste(text) => terminal.send_paste(&text).await,
                }
            }
        }
    }

    async fn handle_approve(&mut self) {
        // Approving from the plan editor first carries any edits back in
        let edited_plan = self.model.plan_editor.take().map(|e| e.plan);
        let source = self.plan_editor_source.take();

        match source {
            Some(WorkflowKey::UltraPlan) | None => {
                let mut ctx = HostCtx::new(&mut self.orch);
                if let Some(ultra) = self.ultra.as_mut() {
                    if let Some(plan) = edited_plan {
                        ultra.replace_plan(plan, &mut ctx);
                    }
                    ultra.approve(&mut ctx);
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            Some(WorkflowKey::InlinePlan(_)) => {
                // Inline plans end at the editor; execution is the user's
                // next move (e.g. :up --file on the saved plan)
                self.model.set_info("Plan closed - run :up to execute it");
            }
            _ => {}
        }
    }

    async fn run_instance_op(&mut self, op: InstanceOp) {
        let Some(id) = self.model.active_instance_id() else {
            self.model.set_error("No active instance");
            return;
        };
        match op {
            InstanceOp::Restart => match self.orch.restart_instance(&id).await {
                Ok(()) => self.model.set_info(format!("Instance {} restarted", id)),
                Err(e) => self.model.set_error(format!("Restart failed: {}", e)),
            },
            InstanceOp::Kill => {
                self.orch.stop_instance(&id).await;
                self.model.set_info(format!("Instance {} stopped", id));
            }
            InstanceOp::TogglePause => {
                let status = self.orch.session.instance_status(&id);
                let result = if status == Some(InstanceStatus::Paused) {
                    self.orch.resume_instance(&id)
                } else {
                    self.orch.pause_instance(&id)
                };
                if let Err(e) = result {
                    self.model.set_error(format!("Pause toggle failed: {}", e));
                }
            }
            InstanceOp::Remove => match self.orch.remove_instance(&id, true).await {
                Ok(()) => {
                    self.model.outputs.remove(&id);
                    self.model.set_info(format!("Instance {} removed", id));
                }
                Err(e) => self.model.set_error(format!("Remove failed: {}", e)),
            },
        }
    }

    async fn start_workflow(&mut self, request: WorkflowRequest) {
        let workflows = self.config.workflows.clone();
        match request {
            WorkflowRequest::TripleShot { task } => {
                let config = TripleShotConfig {
                    auto_approve: workflows.auto_approve,
                    adversarial: false,
                };
                let mut ctx = HostCtx::new(&mut self.orch);
                match TripleShotCoordinator::start(&mut ctx, &task, config) {
                    Ok(coordinator) => {
                        self.triple_shots.insert(coordinator.state.group_id.clone(), coordinator);
                    }
                    Err(e) => self.model.set_error(format!("Triple-shot failed to start: {}", e)),
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            WorkflowRequest::Adversarial { task } => {
                let mut ctx = HostCtx::new(&mut self.orch);
                match AdversarialCoordinator::start(&mut ctx, &task, workflows.max_adversarial_rounds) {
                    Ok(coordinator) => {
                        self.adversarials.insert(coordinator.state.group_id.clone(), coordinator);
                    }
                    Err(e) => self.model.set_error(format!("Adversarial failed to start: {}", e)),
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            WorkflowRequest::MultiPlan { objective } => {
                let mut ctx = HostCtx::new(&mut self.orch);
                match MultiPlanCoordinator::start(&mut ctx, &objective, workflows.multi_pass_planners) {
                    Ok(coordinator) => {
                        self.inline_plans.insert(coordinator.state.group_id.clone(), coordinator);
                    }
                    Err(e) => self.model.set_error(format!("Multi-plan failed to start: {}", e)),
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
            WorkflowRequest::UltraPlan(request) => {
                if self.ultra.as_ref().is_some_and(|u| !u.is_terminal()) {
                    self.model.set_error("An ultra-plan session is already active");
                    return;
                }

                let preloaded = match &request.plan_file {
                    Some(path) => match std::fs::read_to_string(path) {
                        Ok(content) => match PlanSpec::from_yaml(&content) {
                            Ok(plan) => Some(plan),
                            Err(e) => {
                                self.model.set_error(format!("Plan file invalid: {}", e));
                                return;
                            }
                        },
                        Err(e) => {
                            self.model.set_error(format!("Cannot read plan file: {}", e));
                            return;
                        }
                    },
                    None => None,
                };

                let config = UltraPlanConfig::from_workflow(&workflows, request.multi_pass);
                let mut ctx = HostCtx::new(&mut self.orch);
                match UltraPlanCoordinator::start(&mut ctx, &request.objective, config, preloaded) {
                    Ok(coordinator) => self.ultra = Some(coordinator),
                    Err(e) => self.model.set_error(format!("Ultra-plan failed to start: {}", e)),
                }
                let actions = ctx.actions;
                self.apply_actions(actions).await;
            }
        }
    }

    // === Housekeeping ===

    async fn ensure_side_terminal(&mut self) {
        if self.side_terminal.is_some() {
            return;
        }
        let driver = self.orch.driver_handle("shell");
        let mut manager = InstanceManager::new(
            "shell",
            crate::driver::session_name("shell"),
            driver,
            self.orch.bus(),
            TimeoutPolicy::default(),
        );
        let spec = SessionSpec {
            name: crate::driver::session_name("shell"),
            cwd: self.orch.session.base_repo.clone(),
            command: std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string()),
            cols: self.config.agent.cols,
            rows: self.config.agent.rows,
        };
        match manager.start(spec).await {
            Ok(()) => self.side_terminal = Some(manager),
            Err(e) => {
                warn!(error = %e, "side terminal failed to start");
                self.model.set_error(format!("Side terminal failed: {}", e));
                self.model.show_terminal = false;
                self.model.mode = Mode::Normal;
            }
        }
    }

    fn sync_instance_rows(&mut self) {
        self.model.instances = self
            .orch
            .session
            .instances
            .iter()
            .map(|inst| InstanceRow {
                id: inst.id.clone(),
                task: inst.task.clone(),
                status: inst.status,
                has_new: self.model.outputs.state(&inst.id).is_some_and(|s| s.has_new),
            })
            .collect();
        if self.model.active_tab >= self.model.instances.len() {
            self.model.active_tab = self.model.instances.len().saturating_sub(1);
        }
    }

    fn workflow_status_line(&self) -> Option<String> {
        if let Some(ultra) = &self.ultra {
            if !ultra.is_terminal() {
                return Some(format!("ultra-plan: {}", ultra.display_phase()));
            }
        }
        let running_triples = self.triple_shots.values().filter(|c| !c.is_terminal()).count();
        if running_triples > 0 {
            return Some(format!("{} triple-shot(s) running", running_triples));
        }
        let running_adversarial = self.adversarials.values().filter(|c| !c.is_terminal()).count();
        if running_adversarial > 0 {
            return Some(format!("{} adversarial session(s) running", running_adversarial));
        }
        None
    }

    /// Copy live coordinator state back into the session for persistence
    fn sync_workflows_into_session(&mut self) {
        self.orch.session.ultra_plan = self.ultra.as_ref().map(|u| u.state.clone());

        let mut triple_shots: Vec<_> = self.triple_shots.values().map(|c| c.state.clone()).collect();
        triple_shots.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        self.orch.session.triple_shots = triple_shots;

        let mut adversarials: Vec<_> = self.adversarials.values().map(|c| c.state.clone()).collect();
        adversarials.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        self.orch.session.adversarials = adversarials;

        let mut inline_plans: Vec<_> = self.inline_plans.values().map(|c| c.state.clone()).collect();
        inline_plans.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        self.orch.session.inline_plans = inline_plans;
    }
}
