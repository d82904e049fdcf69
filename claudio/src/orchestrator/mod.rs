//! Orchestrator - fleet-wide instance registry and supervisor of supervisors
//!
//! Exclusively owns every [`InstanceManager`] and the session object. All
//! session mutation funnels through here; the UI reads snapshots. Slow work
//! (worktree creation, branch listing, conflict scans) runs on background
//! tasks whose results come back as [`OrchestratorMsg`] values handled on
//! the UI loop.

mod conflicts;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detect::AgentState;
use crate::driver::{DriverFactory, SessionSpec, session_name};
use crate::events::{EventBus, TimeoutKind};
use crate::instance::{InstanceManager, TimeoutPolicy};
use crate::session::{Instance, InstanceStatus, Session, SessionLock, SessionMetrics};
use crate::vcs::GitBackend;

pub use conflicts::{Conflict, ConflictDetector, intersect, scan_conflicts};

/// Results of background orchestrator work, handled on the UI loop
#[derive(Debug)]
pub enum OrchestratorMsg {
    /// Worktree provisioning finished for a two-phase add
    WorktreeReady { instance_id: String },
    /// Worktree provisioning failed
    WorktreeFailed { instance_id: String, error: String },
    /// Result of an async branch listing
    Branches(Result<Vec<String>, String>),
    /// Fresh conflict snapshot
    Conflicts(Vec<Conflict>),
}

/// A status transition observed while pulling instance state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub instance_id: String,
    pub old: InstanceStatus,
    pub new: InstanceStatus,
}

/// Fleet-wide registry and coordinator of instance supervisors
pub struct Orchestrator {
    pub session: Session,
    bus: Arc<EventBus>,
    git: GitBackend,
    driver_factory: Arc<dyn DriverFactory>,
    config: Config,
    main_branch: String,

    managers: HashMap<String, InstanceManager>,
    conflict_detector: ConflictDetector,
    conflict_scan_running: Arc<AtomicBool>,
    last_conflict_scan: Option<tokio::time::Instant>,

    /// Instances whose start is deferred until dependencies complete
    deferred_start: HashSet<String>,

    msg_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    lock: Option<SessionLock>,
}

impl Orchestrator {
    /// Build the orchestrator for a session
    pub async fn new(
        session: Session,
        git: GitBackend,
        driver_factory: Arc<dyn DriverFactory>,
        bus: Arc<EventBus>,
        config: Config,
        msg_tx: mpsc::UnboundedSender<OrchestratorMsg>,
        lock: Option<SessionLock>,
    ) -> Result<Self> {
        let main_branch = git.main_branch().await.unwrap_or_else(|e| {
            warn!(error = %e, "Orchestrator::new: no main branch detected, defaulting to main");
            "main".to_string()
        });
        debug!(%main_branch, "Orchestrator::new");

        let conflict_detector = ConflictDetector::new(config.git.conflict_excludes.clone());
        Ok(Self {
            session,
            bus,
            git,
            driver_factory,
            config,
            main_branch,
            managers: HashMap::new(),
            conflict_detector,
            conflict_scan_running: Arc::new(AtomicBool::new(false)),
            last_conflict_scan: None,
            deferred_start: HashSet::new(),
            msg_tx,
            lock,
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn git(&self) -> &GitBackend {
        &self.git
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    // === Two-phase add ===

    /// Add an instance for a task: fast stub now, worktree in the background
    ///
    /// Returns the new instance id immediately with the instance in
    /// `Pending`; a `WorktreeReady`/`WorktreeFailed` message follows.
    pub fn add_instance(&mut self, task: &str) -> Result<String> {
        let instance = Instance::new(
            task,
            self.git.repo_root(),
            &self.config.git.worktree_dir,
            &self.config.git.branch_prefix,
        );
        let id = instance.id.clone();
        let branch = instance.branch.clone();
        let worktree = instance.worktree_path.clone();
        self.session.add_instance(instance).map_err(|e| eyre!(e))?;
        info!(%id, "Added instance (worktree provisioning queued)");

        self.spawn_worktree_task(id.clone(), worktree, branch, None);
        Ok(id)
    }

    /// Add an instance working on an existing branch
    pub fn add_instance_from_branch(&mut self, task: &str, branch: &str) -> Result<String> {
        let mut instance = Instance::new(
            task,
            self.git.repo_root(),
            &self.config.git.worktree_dir,
            &self.config.git.branch_prefix,
        );
        instance.branch = branch.to_string();
        let id = instance.id.clone();
        let worktree = instance.worktree_path.clone();
        self.session.add_instance(instance).map_err(|e| eyre!(e))?;
        info!(%id, %branch, "Added instance from branch");

        self.spawn_worktree_task(id.clone(), worktree, branch.to_string(), Some(branch.to_string()));
        Ok(id)
    }

    /// Add an instance gated on other instances completing first
    ///
    /// Start is deferred until every dependency reaches `Completed`, then
    /// happens automatically on the next tick.
    pub fn add_dependent_instance(&mut self, task: &str, deps: &[String]) -> Result<String> {
        for dep in deps {
            if self.session.instance(dep).is_none() {
                return Err(eyre!("Unknown dependency instance: {}", dep));
            }
        }

        let id = self.add_instance(task)?;
        for dep in deps {
            self.session.add_dependency(&id, dep).map_err(|e| eyre!(e))?;
        }
        self.deferred_start.insert(id.clone());
        info!(%id, ?deps, "Added dependent instance");
        Ok(id)
    }

    /// Mark an instance to start as soon as its worktree is ready and its
    /// dependencies are satisfied, regardless of the auto-start setting
    ///
    /// Workflow-spawned instances always start this way.
    pub fn queue_start(&mut self, id: &str) {
        self.deferred_start.insert(id.to_string());
    }

    fn spawn_worktree_task(&self, id: String, worktree: PathBuf, branch: String, existing_branch: Option<String>) {
        let git = self.git.clone();
        let base = self.main_branch.clone();
        let tx = self.msg_tx.clone();

        tokio::spawn(async move {
            let result = match existing_branch {
                Some(existing) => git.create_worktree_from_branch(&worktree, &existing).await,
                None => git.create_worktree(&worktree, &branch, &base).await,
            };
            let msg = match result {
                Ok(()) => OrchestratorMsg::WorktreeReady { instance_id: id },
                Err(e) => OrchestratorMsg::WorktreeFailed {
                    instance_id: id,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(msg);
        });
    }

    /// Handle worktree-provisioning completion
    pub async fn on_worktree_ready(&mut self, id: &str) {
        debug!(%id, "on_worktree_ready");
        if let Some(inst) = self.session.instance_mut(id) {
            inst.worktree_ready = true;
        }
        if self.config.ui.auto_start && !self.deferred_start.contains(id) {
            if let Err(e) = self.start_instance(id).await {
                warn!(%id, error = %e, "auto-start failed");
            }
        }
    }

    /// Handle worktree-provisioning failure
    pub fn on_worktree_failed(&mut self, id: &str, error: &str) {
        warn!(%id, %error, "Worktree creation failed");
        if let Some(inst) = self.session.instance_mut(id) {
            let _ = inst.transition(InstanceStatus::Error);
        }
        self.deferred_start.remove(id);
    }

    // === Lifecycle ===

    /// Start an instance's agent session
    pub async fn start_instance(&mut self, id: &str) -> Result<()> {
        let inst = self
            .session
            .instance(id)
            .ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        if !inst.worktree_ready {
            return Err(eyre!("Worktree not ready for {}", id));
        }
        if inst.status.is_live() {
            debug!(%id, "start_instance: already live");
            return Ok(());
        }
        let satisfied = {
            let statuses: HashMap<String, InstanceStatus> =
                self.session.instances.iter().map(|i| (i.id.clone(), i.status)).collect();
            inst.deps_satisfied(|dep| statuses.get(dep).copied())
        };
        if !satisfied {
            return Err(eyre!("Dependencies not complete for {}", id));
        }

        let spec = SessionSpec {
            name: inst.session_name.clone(),
            cwd: inst.worktree_path.clone(),
            command: agent_command(&self.config.agent.command, &inst.task),
            cols: self.config.agent.cols,
            rows: self.config.agent.rows,
        };

        // Exactly one manager (and thus one driver handle) per instance id
        let manager = self.managers.entry(id.to_string()).or_insert_with(|| {
            InstanceManager::new(
                id,
                spec.name.clone(),
                self.driver_factory.driver_for(id),
                self.bus.clone(),
                TimeoutPolicy::from(&self.config.timeouts),
            )
        });
        if manager.running() {
            return Err(eyre!("Instance {} is already running", id));
        }

        manager.start(spec).await.context("Failed to start instance session")?;

        let inst = self.session.instance_mut(id).expect("checked above");
        inst.transition(InstanceStatus::Working).map_err(|e| eyre!(e))?;
        inst.metrics.started_at = Some(chrono::Utc::now());
        self.deferred_start.remove(id);
        Ok(())
    }

    /// Stop an instance's session; idempotent, status untouched
    pub async fn stop_instance(&mut self, id: &str) {
        if let Some(manager) = self.managers.get_mut(id) {
            manager.stop().await;
        }
    }

    /// Pause capture, keeping the session alive
    ///
    /// The pre-pause status is recorded so resume restores it exactly.
    pub fn pause_instance(&mut self, id: &str) -> Result<()> {
        let manager = self.managers.get(id).ok_or_else(|| eyre!("Instance {} not running", id))?;
        let inst = self.session.instance_mut(id).ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        let prior = inst.status;
        inst.transition(InstanceStatus::Paused).map_err(|e| eyre!(e))?;
        inst.paused_from = Some(prior);
        manager.pause();
        Ok(())
    }

    /// Resume a paused instance, restoring the status it was paused from
    ///
    /// Pause then resume is observationally a no-op: a WaitingInput instance
    /// comes back WaitingInput, not Working. Supervision timers restart only
    /// when the restored status is Working, so an agent-side wait keeps its
    /// accumulated window.
    pub fn resume_instance(&mut self, id: &str) -> Result<()> {
        let manager = self.managers.get(id).ok_or_else(|| eyre!("Instance {} not running", id))?;
        let inst = self.session.instance_mut(id).ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        let restored = inst.paused_from.unwrap_or(InstanceStatus::Working);
        inst.transition(restored).map_err(|e| eyre!(e))?;
        inst.paused_from = None;
        manager.resume(restored == InstanceStatus::Working);
        Ok(())
    }

    /// Restart after an error/timeout: clear counters, recreate the session
    /// if needed, and mark the instance Working again
    pub async fn restart_instance(&mut self, id: &str) -> Result<()> {
        let inst = self
            .session
            .instance(id)
            .ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        let spec = SessionSpec {
            name: inst.session_name.clone(),
            cwd: inst.worktree_path.clone(),
            command: agent_command(&self.config.agent.command, &inst.task),
            cols: self.config.agent.cols,
            rows: self.config.agent.rows,
        };

        let manager = self.managers.get_mut(id).ok_or_else(|| eyre!("Instance {} was never started", id))?;
        manager.clear_timeout();
        if !manager.session_exists().await {
            manager.stop().await;
            manager.start(spec).await.context("Failed to recreate session")?;
        } else if !manager.running() {
            manager.reconnect();
        }

        let inst = self.session.instance_mut(id).expect("checked above");
        inst.transition(InstanceStatus::Working).map_err(|e| eyre!(e))?;
        info!(%id, "Instance restarted");
        Ok(())
    }

    /// Remove an instance: driver teardown first, then worktree, then the
    /// record. Non-force removal refuses while the instance is live.
    pub async fn remove_instance(&mut self, id: &str, force: bool) -> Result<()> {
        let inst = self
            .session
            .instance(id)
            .ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        if inst.status.is_live() && !force {
            return Err(eyre!("Instance {} is running; use force to remove", id));
        }
        let worktree = inst.worktree_path.clone();
        let branch = inst.branch.clone();

        if let Some(mut manager) = self.managers.remove(id) {
            manager.stop().await;
        }
        if let Err(e) = self.git.remove_worktree(&worktree, true).await {
            warn!(%id, error = %e, "remove_instance: worktree removal failed");
        }
        self.git.delete_branch(&branch).await;

        self.session.remove_instance(id);
        self.deferred_start.remove(id);
        info!(%id, "Instance removed");
        Ok(())
    }

    /// Re-attach to an instance whose driver session outlived the console
    pub fn reconnect_instance(&mut self, id: &str) -> Result<()> {
        let inst = self
            .session
            .instance(id)
            .ok_or_else(|| eyre!("Unknown instance: {}", id))?;
        if self.managers.contains_key(id) {
            return Err(eyre!("Instance {} already has a manager", id));
        }
        let manager = InstanceManager::new(
            id,
            inst.session_name.clone(),
            self.driver_factory.driver_for(id),
            self.bus.clone(),
            TimeoutPolicy::from(&self.config.timeouts),
        );
        self.managers.insert(id.to_string(), manager);
        self.managers.get_mut(id).expect("just inserted").reconnect();
        info!(%id, "Reconnected to instance");
        Ok(())
    }

    /// Resize every live session
    pub async fn resize_all(&self, cols: u16, rows: u16) {
        futures::future::join_all(self.managers.values().map(|m| m.resize(cols, rows))).await;
    }

    // === Accessors ===

    pub fn manager(&self, id: &str) -> Option<&InstanceManager> {
        self.managers.get(id)
    }

    /// Driver handle for an auxiliary session (side terminal)
    pub fn driver_handle(&self, id: &str) -> std::sync::Arc<dyn crate::driver::TerminalDriver> {
        self.driver_factory.driver_for(id)
    }

    pub fn manager_ids(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }

    pub fn session_metrics(&self) -> SessionMetrics {
        self.session.metrics()
    }

    /// Rename a group (workflow-driven or user `:rename`)
    pub fn request_group_rename(&mut self, group_id: &str, name: &str) -> Result<()> {
        let group = self
            .session
            .group_mut(group_id)
            .ok_or_else(|| eyre!("Unknown group: {}", group_id))?;
        group.name = name.to_string();
        Ok(())
    }

    /// Release the session lock (shutdown path)
    pub fn release_lock(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }

    // === Background listings ===

    /// List branches on a background task; result arrives as a message
    pub fn list_branches_async(&self) {
        let git = self.git.clone();
        let tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = git.list_branches().await.map_err(|e| e.to_string());
            let _ = tx.send(OrchestratorMsg::Branches(result));
        });
    }

    // === Tick-driven supervision ===

    /// Pull classified state from every capture loop and reconcile instance
    /// status, returning the transitions that occurred
    pub fn pull_states(&mut self) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for (id, manager) in &self.managers {
            let Some(inst) = self.session.instance(id) else { continue };
            let old = inst.status;
            if !matches!(old, InstanceStatus::Working | InstanceStatus::WaitingInput) {
                continue;
            }

            let new = if !manager.running() && manager.last_error().is_some() {
                InstanceStatus::Error
            } else {
                match manager.current_state() {
                    AgentState::Working => InstanceStatus::Working,
                    AgentState::WaitingPermission | AgentState::WaitingQuestion | AgentState::WaitingInput => {
                        InstanceStatus::WaitingInput
                    }
                    AgentState::Completed => InstanceStatus::Completed,
                    AgentState::Error => InstanceStatus::Error,
                }
            };
            if new != old {
                changes.push(StateChange {
                    instance_id: id.clone(),
                    old,
                    new,
                });
            }
        }

        for change in &changes {
            if let Some(inst) = self.session.instance_mut(&change.instance_id) {
                match inst.transition(change.new) {
                    Ok(()) => {
                        if change.new.is_terminal() {
                            inst.metrics.ended_at = Some(chrono::Utc::now());
                        }
                    }
                    Err(e) => warn!(error = %e, "pull_states: transition rejected"),
                }
            }
        }
        changes
    }

    /// Apply a timeout event from the bus: Stale means Stuck, the other
    /// kinds mean Timeout
    pub fn apply_timeout(&mut self, instance_id: &str, kind: TimeoutKind) -> Option<StateChange> {
        let inst = self.session.instance_mut(instance_id)?;
        let old = inst.status;
        let new = match kind {
            TimeoutKind::Stale => InstanceStatus::Stuck,
            TimeoutKind::Activity | TimeoutKind::Completion => InstanceStatus::Timeout,
        };
        if old == new || inst.transition(new).is_err() {
            return None;
        }
        Some(StateChange {
            instance_id: instance_id.to_string(),
            old,
            new,
        })
    }

    /// Start anything ready whose dependencies are now satisfied
    ///
    /// Covers both config-driven auto-start and dependent instances whose
    /// parents just completed; a dependent whose parent is already Completed
    /// at add time starts on the next tick.
    pub async fn process_auto_start(&mut self) {
        let statuses: HashMap<String, InstanceStatus> =
            self.session.instances.iter().map(|i| (i.id.clone(), i.status)).collect();

        let ready: Vec<String> = self
            .session
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Pending && i.worktree_ready)
            .filter(|i| self.deferred_start.contains(&i.id) || (self.config.ui.auto_start && i.depends_on.is_empty()))
            .filter(|i| i.deps_satisfied(|dep| statuses.get(dep).copied()))
            .map(|i| i.id.clone())
            .collect();

        for id in ready {
            debug!(%id, "process_auto_start: starting");
            if let Err(e) = self.start_instance(&id).await {
                warn!(%id, error = %e, "process_auto_start: failed");
            }
        }
    }

    // === Conflicts ===

    pub fn conflicts(&self) -> &[Conflict] {
        self.conflict_detector.conflicts()
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<Conflict>) {
        self.conflict_detector.update(conflicts);
    }

    /// Kick off a background conflict scan if the poll interval elapsed
    pub fn dispatch_conflict_scan(&mut self) {
        let interval = Duration::from_secs(self.config.git.conflict_poll_secs.max(1));
        let now = tokio::time::Instant::now();
        if let Some(last) = self.last_conflict_scan {
            if now.duration_since(last) < interval {
                return;
            }
        }
        if self.conflict_scan_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.last_conflict_scan = Some(now);

        let live: Vec<(String, PathBuf)> = self
            .session
            .instances
            .iter()
            .filter(|i| i.status.is_live() && i.worktree_ready)
            .map(|i| (i.id.clone(), i.worktree_path.clone()))
            .collect();
        let git = self.git.clone();
        let excludes = self.conflict_detector.excludes().to_vec();
        let tx = self.msg_tx.clone();
        let running = self.conflict_scan_running.clone();

        tokio::spawn(async move {
            let conflicts = scan_conflicts(&git, &live, &excludes).await;
            running.store(false, Ordering::SeqCst);
            let _ = tx.send(OrchestratorMsg::Conflicts(conflicts));
        });
    }

    /// Stop every manager and release the lock (shutdown)
    pub async fn shutdown(&mut self) {
        info!("Orchestrator shutting down {} managers", self.managers.len());
        for (_, manager) in self.managers.iter_mut() {
            manager.stop().await;
        }
        self.release_lock();
    }
}

/// Build the agent launch command for a task
///
/// The task text rides along as a single-quoted argument.
fn agent_command(base: &str, task: &str) -> String {
    format!("{} {}", base, shell_quote(task))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FakeDriver, TerminalDriver};
    use tempfile::tempdir;
    use tokio::process::Command;

    async fn setup_repo(dir: &std::path::Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@t.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
        tokio::fs::write(dir.join("README.md"), "x\n").await.unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "init"]] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    struct Fixture {
        orch: Orchestrator,
        driver: Arc<FakeDriver>,
        rx: mpsc::UnboundedReceiver<OrchestratorMsg>,
        _repo: tempfile::TempDir,
        _trees: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let repo = tempdir().unwrap();
        let trees = tempdir().unwrap();
        setup_repo(repo.path()).await;

        let mut config = Config::default();
        config.git.worktree_dir = trees.path().to_path_buf();
        config.timeouts.stale_secs = 0;
        config.timeouts.activity_secs = 0;

        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new("test", repo.path());
        let git = GitBackend::new(repo.path());
        let orch = Orchestrator::new(session, git, Arc::new(driver.clone()), bus, config, tx, None)
            .await
            .unwrap();

        Fixture {
            orch,
            driver,
            rx,
            _repo: repo,
            _trees: trees,
        }
    }

    async fn drain_until_ready(fx: &mut Fixture) -> String {
        loop {
            match fx.rx.recv().await.expect("message") {
                OrchestratorMsg::WorktreeReady { instance_id } => {
                    fx.orch.on_worktree_ready(&instance_id).await;
                    return instance_id;
                }
                OrchestratorMsg::WorktreeFailed { instance_id, error } => {
                    panic!("worktree failed for {}: {}", instance_id, error);
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_two_phase_add_auto_starts() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("write docs").unwrap();
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Pending));

        let ready = drain_until_ready(&mut fx).await;
        assert_eq!(ready, id);
        // auto_start on: instance went straight to Working
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Working));
        assert!(fx.driver.session_exists(&session_name(&id)).await);
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_dependent_gated_until_parent_completes() {
        let mut fx = fixture().await;
        let parent = fx.orch.add_instance("parent").unwrap();
        drain_until_ready(&mut fx).await;

        let child = fx.orch.add_dependent_instance("child", &[parent.clone()]).unwrap();
        drain_until_ready(&mut fx).await;

        // Parent still working: child stays pending across ticks
        fx.orch.process_auto_start().await;
        assert_eq!(fx.orch.session.instance_status(&child), Some(InstanceStatus::Pending));

        // Parent completes
        fx.orch
            .session
            .instance_mut(&parent)
            .unwrap()
            .transition(InstanceStatus::Completed)
            .unwrap();

        // Next tick starts the child
        fx.orch.process_auto_start().await;
        assert_eq!(fx.orch.session.instance_status(&child), Some(InstanceStatus::Working));
        assert!(fx.driver.session_exists(&session_name(&child)).await);
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_dependent_on_already_completed_parent() {
        let mut fx = fixture().await;
        let parent = fx.orch.add_instance("parent").unwrap();
        drain_until_ready(&mut fx).await;
        fx.orch
            .session
            .instance_mut(&parent)
            .unwrap()
            .transition(InstanceStatus::Completed)
            .unwrap();

        let child = fx.orch.add_dependent_instance("child", &[parent]).unwrap();
        drain_until_ready(&mut fx).await;
        fx.orch.process_auto_start().await;
        assert_eq!(fx.orch.session.instance_status(&child), Some(InstanceStatus::Working));
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarted_parent_regates_children() {
        let mut fx = fixture().await;
        let parent = fx.orch.add_instance("parent").unwrap();
        drain_until_ready(&mut fx).await;
        fx.orch
            .session
            .instance_mut(&parent)
            .unwrap()
            .transition(InstanceStatus::Completed)
            .unwrap();

        let child = fx.orch.add_dependent_instance("child", &[parent.clone()]).unwrap();
        drain_until_ready(&mut fx).await;

        // Parent goes back to Working via restart before the child starts
        fx.orch
            .session
            .instance_mut(&parent)
            .unwrap()
            .transition(InstanceStatus::Working)
            .unwrap();

        fx.orch.process_auto_start().await;
        assert_eq!(fx.orch.session.instance_status(&child), Some(InstanceStatus::Pending));
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_pull_states_maps_agent_state() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("task").unwrap();
        drain_until_ready(&mut fx).await;

        fx.driver
            .set_frame(&session_name(&id), "Task complete\nSummary of changes\n");
        tokio::time::sleep(Duration::from_millis(300)).await;

        let changes = fx.orch.pull_states();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new, InstanceStatus::Completed);
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Completed));
        assert!(fx.orch.session.instance(&id).unwrap().metrics.ended_at.is_some());
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_timeout_maps_kinds() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("task").unwrap();
        drain_until_ready(&mut fx).await;

        let change = fx.orch.apply_timeout(&id, TimeoutKind::Stale).unwrap();
        assert_eq!(change.new, InstanceStatus::Stuck);

        // Restart then hit an activity timeout
        fx.orch.restart_instance(&id).await.unwrap();
        let change = fx.orch.apply_timeout(&id, TimeoutKind::Activity).unwrap();
        assert_eq!(change.new, InstanceStatus::Timeout);
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_instance_tears_down() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("task").unwrap();
        drain_until_ready(&mut fx).await;
        let worktree = fx.orch.session.instance(&id).unwrap().worktree_path.clone();
        assert!(worktree.exists());

        // Live instance needs force
        assert!(fx.orch.remove_instance(&id, false).await.is_err());
        fx.orch.remove_instance(&id, true).await.unwrap();

        assert!(fx.orch.session.instance(&id).is_none());
        assert!(!worktree.exists());
        assert!(!fx.driver.session_exists(&session_name(&id)).await);
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("task").unwrap();
        drain_until_ready(&mut fx).await;

        fx.orch.pause_instance(&id).unwrap();
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Paused));
        assert_eq!(
            fx.orch.session.instance(&id).unwrap().paused_from,
            Some(InstanceStatus::Working)
        );
        fx.orch.resume_instance(&id).unwrap();
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Working));
        assert!(fx.orch.session.instance(&id).unwrap().paused_from.is_none());
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_resume_restores_waiting_input() {
        let mut fx = fixture().await;
        let id = fx.orch.add_instance("task").unwrap();
        drain_until_ready(&mut fx).await;

        // Agent oscillated into WaitingInput before the pause
        fx.orch
            .session
            .instance_mut(&id)
            .unwrap()
            .transition(InstanceStatus::WaitingInput)
            .unwrap();

        fx.orch.pause_instance(&id).unwrap();
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::Paused));
        assert_eq!(
            fx.orch.session.instance(&id).unwrap().paused_from,
            Some(InstanceStatus::WaitingInput)
        );

        // Resume restores the exact pre-pause status, not Working
        fx.orch.resume_instance(&id).unwrap();
        assert_eq!(fx.orch.session.instance_status(&id), Some(InstanceStatus::WaitingInput));
        assert!(fx.orch.session.instance(&id).unwrap().paused_from.is_none());
        fx.orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
