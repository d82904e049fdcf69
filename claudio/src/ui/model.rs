//! UI model - pure state, no rendering, no I/O
//!
//! The model holds everything the views draw and everything the input
//! router mutates. Slow work never happens here; the model records pending
//! requests that the app loop picks up on the next tick.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::output::{FilterEngine, OutputManager, SearchEngine};
use crate::plan::PlanSpec;
use crate::session::InstanceStatus;
use crate::workflows::GroupDecisionChoice;

use super::command::{CommandResult, UltraPlanRequest};

/// Interaction modes; at most one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    /// `:` command entry
    Command,
    /// Keystrokes forward to the active instance
    Input,
    /// Keystrokes forward to the side terminal
    Terminal,
    /// `/` search entry
    Search,
    /// Filter configuration
    Filter,
    /// New-task text entry
    TaskInput,
    /// Reviewing/editing a plan
    PlanEditor,
}

/// Where a forwarded keystroke goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyTarget {
    Instance(String),
    SideTerminal,
}

/// One forwarded input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPress {
    /// Named key ("Enter", "Escape", "Up", "C-c")
    Named(String),
    /// Literal character
    Literal(String),
    /// Bracketed paste block
    Paste(String),
}

/// A queued keystroke for the app loop to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySend {
    pub target: KeyTarget,
    pub press: KeyPress,
}

/// Per-instance operations requested from the keyboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOp {
    Restart,
    Kill,
    TogglePause,
    Remove,
}

/// Workflow launches requested through the command layer
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowRequest {
    TripleShot { task: String },
    Adversarial { task: String },
    MultiPlan { objective: String },
    UltraPlan(UltraPlanRequest),
}

/// Plan editor state
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEditorState {
    pub plan: PlanSpec,
    pub selected: usize,
}

/// Sidebar row snapshot for one instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRow {
    pub id: String,
    pub task: String,
    pub status: InstanceStatus,
    pub has_new: bool,
}

/// The UI model
pub struct Model {
    pub mode: Mode,
    /// Armed by `g`, consumed by the next key
    pub pending_group_cmd: bool,

    pub command_buffer: String,
    pub search_buffer: String,
    pub filter_buffer: String,
    pub task_buffer: String,

    /// Sidebar rows, refreshed from the session each tick
    pub instances: Vec<InstanceRow>,
    pub active_tab: usize,

    pub outputs: OutputManager,
    pub search: SearchEngine,
    pub filter: FilterEngine,
    pub plan_editor: Option<PlanEditorState>,

    pub info_message: Option<String>,
    info_set_at: Option<Instant>,
    pub error_message: Option<String>,
    error_set_at: Option<Instant>,
    message_ttl: Duration,

    pub show_help: bool,
    pub show_stats: bool,
    pub show_diff: bool,
    pub show_conflicts: bool,
    pub show_terminal: bool,

    pub branches: Vec<String>,
    pub workflow_status: Option<String>,
    /// Latest conflict snapshot, copied in by the app loop
    pub conflicts: Vec<crate::orchestrator::Conflict>,
    /// Fleet metrics for the stats panel
    pub stats: Option<crate::session::SessionMetrics>,
    /// Side-terminal capture for the terminal pane
    pub terminal_output: String,
    pub should_quit: bool,

    /// Viewport height of the output pane, maintained by the renderer
    pub output_height: usize,

    // Pending requests consumed by the app loop
    pub pending_keys: Vec<KeySend>,
    pub pending_new_task: Option<String>,
    pub pending_workflow: Option<WorkflowRequest>,
    pub pending_instance_op: Option<InstanceOp>,
    pub pending_approve: bool,
    pub pending_plan_cancel: bool,
    pub pending_resume_consolidation: bool,
    pub pending_group_decision: Option<GroupDecisionChoice>,
    pub pending_branch_list: bool,
}

impl Model {
    pub fn new(message_ttl: Duration) -> Self {
        Self {
            mode: Mode::Normal,
            pending_group_cmd: false,
            command_buffer: String::new(),
            search_buffer: String::new(),
            filter_buffer: String::new(),
            task_buffer: String::new(),
            instances: Vec::new(),
            active_tab: 0,
            outputs: OutputManager::new(),
            search: SearchEngine::new(),
            filter: FilterEngine::new(),
            plan_editor: None,
            info_message: None,
            info_set_at: None,
            error_message: None,
            error_set_at: None,
            message_ttl,
            show_help: false,
            show_stats: false,
            show_diff: false,
            show_conflicts: false,
            show_terminal: false,
            branches: Vec::new(),
            workflow_status: None,
            conflicts: Vec::new(),
            stats: None,
            terminal_output: String::new(),
            should_quit: false,
            output_height: 40,
            pending_keys: Vec::new(),
            pending_new_task: None,
            pending_workflow: None,
            pending_instance_op: None,
            pending_approve: false,
            pending_plan_cancel: false,
            pending_resume_consolidation: false,
            pending_group_decision: None,
            pending_branch_list: false,
        }
    }

    /// The instance under the active tab
    pub fn active_instance(&self) -> Option<&InstanceRow> {
        self.instances.get(self.active_tab)
    }

    pub fn active_instance_id(&self) -> Option<String> {
        self.active_instance().map(|r| r.id.clone())
    }

    /// Move the active tab by delta, clamped
    pub fn shift_tab(&mut self, delta: i32) {
        if self.instances.is_empty() {
            self.active_tab = 0;
            return;
        }
        let max = self.instances.len() as i32 - 1;
        self.active_tab = (self.active_tab as i32 + delta).clamp(0, max) as usize;
    }

    // === Banners ===

    pub fn set_info(&mut self, message: impl Into<String>) {
        self.info_message = Some(message.into());
        self.info_set_at = Some(Instant::now());
    }

    /// Errors replace info with a different banner colour, never silently
    /// overwrite it in place
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.error_set_at = Some(Instant::now());
    }

    /// Drop transient banners past their TTL
    pub fn dismiss_stale_messages(&mut self) {
        let expired = |set_at: &Option<Instant>, ttl: Duration| set_at.is_some_and(|t| t.elapsed() >= ttl);
        if expired(&self.info_set_at, self.message_ttl) {
            self.info_message = None;
            self.info_set_at = None;
        }
        if expired(&self.error_set_at, self.message_ttl) {
            self.error_message = None;
            self.error_set_at = None;
        }
    }

    // === Search helpers ===

    /// Commit the search buffer as the active pattern over current output
    pub fn apply_search(&mut self) {
        let pattern = self.search_buffer.clone();
        let Some(id) = self.active_instance_id() else { return };
        let text = self.outputs.state(&id).map(|s| s.text.clone()).unwrap_or_default();
        let lines: Vec<&str> = text.lines().collect();
        self.search.set_pattern(&pattern, &lines);
        if let Some(line) = self.search.current_line() {
            self.center_on_line(&id, line);
        }
    }

    /// Jump to the next/previous match, centering it in the viewport
    pub fn search_step(&mut self, forward: bool) {
        let Some(id) = self.active_instance_id() else { return };
        let line = if forward { self.search.next() } else { self.search.prev() };
        if let Some(line) = line {
            self.center_on_line(&id, line);
        }
    }

    fn center_on_line(&mut self, id: &str, line: usize) {
        let max = self
            .outputs
            .state(id)
            .map(|s| s.max_scroll(self.output_height))
            .unwrap_or(0);
        let target = SearchEngine::center_target(line, self.output_height, max);
        self.outputs.scroll_to(id, target, self.output_height);
    }

    /// Re-run the active search after output changed
    pub fn rescan_search(&mut self) {
        if !self.search.is_active() {
            return;
        }
        let Some(id) = self.active_instance_id() else { return };
        let text = self.outputs.state(&id).map(|s| s.text.clone()).unwrap_or_default();
        let lines: Vec<&str> = text.lines().collect();
        self.search.rescan(&lines);
    }

    // === Command results ===

    /// Apply a command result field by field; presence means "apply this
    /// mutation", absence leaves the model untouched
    pub fn apply(&mut self, result: CommandResult) {
        debug!(?result, "Model::apply");
        if let Some(message) = result.info {
            self.set_info(message);
        }
        if let Some(message) = result.error {
            self.set_error(message);
        }
        if let Some(value) = result.toggle_help {
            self.show_help = value;
        }
        if let Some(value) = result.toggle_stats {
            self.show_stats = value;
        }
        if let Some(value) = result.toggle_diff {
            self.show_diff = value;
        }
        if let Some(value) = result.toggle_conflicts {
            self.show_conflicts = value;
        }
        if let Some(mode) = result.enter_mode {
            self.mode = mode;
        }
        if let Some(delta) = result.tab_delta {
            self.shift_tab(delta);
        }
        if result.ensure_active_visible {
            let id = self.active_instance_id();
            if let Some(id) = id {
                self.outputs.scroll_to_bottom(&id, self.output_height);
            }
        }
        if let Some(task) = result.start_triple_shot {
            self.pending_workflow = Some(WorkflowRequest::TripleShot { task });
        }
        if let Some(task) = result.start_adversarial {
            self.pending_workflow = Some(WorkflowRequest::Adversarial { task });
        }
        if let Some(objective) = result.start_plan {
            self.pending_workflow = Some(WorkflowRequest::UltraPlan(UltraPlanRequest {
                objective,
                multi_pass: false,
                plan_file: None,
            }));
        }
        if let Some(objective) = result.start_multi_plan {
            self.pending_workflow = Some(WorkflowRequest::MultiPlan { objective });
        }
        if let Some(request) = result.start_ultra_plan {
            self.pending_workflow = Some(WorkflowRequest::UltraPlan(request));
        }
        if result.resume_consolidation {
            self.pending_resume_consolidation = true;
        }
        if result.approve {
            self.pending_approve = true;
        }
        if let Some(choice) = result.group_decision {
            self.pending_group_decision = Some(choice);
        }
        if let Some(task) = result.new_task {
            self.pending_new_task = Some(task);
        }
        if result.list_branches {
            self.pending_branch_list = true;
        }
        if result.quit {
            self.should_quit = true;
        }
    }
}

/// What the command layer may read; a snapshot, not the live model
#[derive(Debug, Clone, Default)]
pub struct ModelView {
    pub instance_count: usize,
    pub active_instance: Option<String>,
    pub has_ultra_plan: bool,
    pub ultra_plan_paused: bool,
}

impl Model {
    pub fn view(&self, has_ultra_plan: bool, ultra_plan_paused: bool) -> ModelView {
        ModelView {
            instance_count: self.instances.len(),
            active_instance: self.active_instance_id(),
            has_ultra_plan,
            ultra_plan_paused,
        }
    }
}
