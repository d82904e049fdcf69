//! Instance supervision - the per-instance capture loop
//!
//! Each [`InstanceManager`] owns exactly one driver handle and runs one
//! capture task. The task scrapes the visible buffer on a fixed tick,
//! feeds the state detector on change, tracks activity/completion/stale
//! timers, and publishes timeout events on the bus. All other components
//! read the manager's shared state; nothing else touches the driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::detect::{AgentState, classify};
use crate::driver::{DriverError, SessionSpec, TerminalDriver};
use crate::events::{Event, EventBus, TimeoutKind};

/// Interval between captures
pub const CAPTURE_TICK: Duration = Duration::from_millis(100);

/// Timeout bounds; `None` disables a check
#[derive(Debug, Clone, Default)]
pub struct TimeoutPolicy {
    pub activity: Option<Duration>,
    pub completion: Option<Duration>,
    pub stale: Option<Duration>,
}

impl From<&TimeoutConfig> for TimeoutPolicy {
    fn from(config: &TimeoutConfig) -> Self {
        let secs = |n: u64| (n > 0).then(|| Duration::from_secs(n));
        Self {
            activity: secs(config.activity_secs),
            completion: secs(config.completion_secs),
            stale: secs(config.stale_secs),
        }
    }
}

/// State shared between the manager and its capture task
struct Shared {
    output: Mutex<String>,
    state: Mutex<AgentState>,
    error: Mutex<Option<String>>,
    paused: AtomicBool,
    stop: AtomicBool,
    running: AtomicBool,
    last_activity: Mutex<Instant>,
    stale_since: Mutex<Option<Instant>>,
    started_at: Mutex<Instant>,
    fired: Mutex<HashSet<TimeoutKind>>,
}

impl Shared {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            output: Mutex::new(String::new()),
            state: Mutex::new(AgentState::Working),
            error: Mutex::new(None),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_activity: Mutex::new(now),
            stale_since: Mutex::new(None),
            started_at: Mutex::new(now),
            fired: Mutex::new(HashSet::new()),
        }
    }

    fn reset_timers(&self) {
        let now = Instant::now();
        *self.last_activity.lock().unwrap() = now;
        *self.started_at.lock().unwrap() = now;
        *self.stale_since.lock().unwrap() = None;
        self.fired.lock().unwrap().clear();
    }
}

/// Per-instance supervisor
pub struct InstanceManager {
    id: String,
    session_name: String,
    driver: Arc<dyn TerminalDriver>,
    bus: Arc<EventBus>,
    policy: TimeoutPolicy,
    tick: Duration,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl InstanceManager {
    /// Create a manager; nothing runs until [`start`](Self::start)
    pub fn new(
        id: impl Into<String>,
        session_name: impl Into<String>,
        driver: Arc<dyn TerminalDriver>,
        bus: Arc<EventBus>,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            session_name: session_name.into(),
            driver,
            bus,
            policy,
            tick: CAPTURE_TICK,
            shared: Arc::new(Shared::new()),
            task: None,
        }
    }

    /// Override the capture tick (tests)
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Acquire the session and begin capturing
    ///
    /// Fails if the session name is already in use.
    pub async fn start(&mut self, spec: SessionSpec) -> Result<(), DriverError> {
        debug!(id = %self.id, session = %self.session_name, "InstanceManager::start");
        if self.driver.session_exists(&self.session_name).await {
            return Err(DriverError::SessionExists(self.session_name.clone()));
        }
        self.driver.create_session(&spec).await?;

        self.shared = Arc::new(Shared::new());
        self.shared.running.store(true, Ordering::SeqCst);
        self.task = Some(self.spawn_capture_loop());
        info!(id = %self.id, "Instance started");
        Ok(())
    }

    /// Re-attach to a still-living session after a console restart
    pub fn reconnect(&mut self) {
        debug!(id = %self.id, "InstanceManager::reconnect");
        self.shared = Arc::new(Shared::new());
        self.shared.running.store(true, Ordering::SeqCst);
        self.task = Some(self.spawn_capture_loop());
    }

    fn spawn_capture_loop(&self) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let driver = self.driver.clone();
        let bus = self.bus.clone();
        let policy = self.policy.clone();
        let id = self.id.clone();
        let session = self.session_name.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            debug!(%id, "capture loop: started");
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                // Stop wins over pause
                if shared.stop.load(Ordering::SeqCst) {
                    debug!(%id, "capture loop: stop observed");
                    break;
                }
                if shared.paused.load(Ordering::SeqCst) {
                    continue;
                }

                let buffer = match driver.capture(&session).await {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        warn!(%id, error = %e, "capture loop: capture failed, marking Error");
                        *shared.error.lock().unwrap() = Some(e.to_string());
                        *shared.state.lock().unwrap() = AgentState::Error;
                        shared.running.store(false, Ordering::SeqCst);
                        break;
                    }
                };

                let now = Instant::now();
                let (changed, rang_bell) = {
                    let mut output = shared.output.lock().unwrap();
                    if *output != buffer {
                        let previous_state = *shared.state.lock().unwrap();
                        let previous = std::mem::replace(&mut *output, buffer);
                        let next = classify(&output, Some(previous.as_str()), previous_state);
                        if next != previous_state {
                            debug!(%id, ?previous_state, ?next, "capture loop: state transition");
                        }
                        *shared.state.lock().unwrap() = next;
                        let rang_bell = output.contains('\u{7}') && !previous.contains('\u{7}');
                        (true, rang_bell)
                    } else {
                        (false, false)
                    }
                };

                if rang_bell {
                    bus.publish(Event::InstanceBell {
                        instance_id: id.clone(),
                    });
                }

                if changed {
                    *shared.last_activity.lock().unwrap() = now;
                    *shared.stale_since.lock().unwrap() = None;
                } else {
                    // Stale snapshots short-circuit the detector entirely
                    let working = *shared.state.lock().unwrap() == AgentState::Working;
                    if working && policy.stale.is_some() {
                        let mut stale_since = shared.stale_since.lock().unwrap();
                        let since = *stale_since.get_or_insert(now);
                        if now.duration_since(since) >= policy.stale.unwrap() {
                            drop(stale_since);
                            fire_timeout(&shared, &bus, &id, TimeoutKind::Stale);
                        }
                    }
                }

                if let Some(bound) = policy.activity {
                    let last = *shared.last_activity.lock().unwrap();
                    if now.duration_since(last) >= bound {
                        fire_timeout(&shared, &bus, &id, TimeoutKind::Activity);
                    }
                }
                if let Some(bound) = policy.completion {
                    let started = *shared.started_at.lock().unwrap();
                    if now.duration_since(started) >= bound {
                        fire_timeout(&shared, &bus, &id, TimeoutKind::Completion);
                    }
                }
            }
            debug!(%id, "capture loop: exited");
        })
    }

    /// Stop capturing and release the driver session; idempotent
    pub async fn stop(&mut self) {
        debug!(id = %self.id, "InstanceManager::stop");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        match self.driver.kill_session(&self.session_name).await {
            Ok(()) | Err(DriverError::SessionNotFound(_)) => {}
            Err(e) => warn!(id = %self.id, error = %e, "InstanceManager::stop: kill failed"),
        }
        info!(id = %self.id, "Instance stopped");
    }

    /// Suspend the capture loop; the driver session stays alive
    pub fn pause(&self) {
        debug!(id = %self.id, "InstanceManager::pause");
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Continue capturing after a pause
    ///
    /// With `reset_timers` the activity/stale windows restart so the pause
    /// itself never counts toward a timeout; pass false when the instance
    /// resumes into a non-Working status (an agent-side wait keeps its
    /// accumulated window, making pause then resume a true no-op).
    pub fn resume(&self, reset_timers: bool) {
        debug!(id = %self.id, reset_timers, "InstanceManager::resume");
        if reset_timers {
            let now = Instant::now();
            *self.shared.last_activity.lock().unwrap() = now;
            *self.shared.stale_since.lock().unwrap() = None;
        }
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Forward a named key; driver failures are logged, not surfaced
    pub async fn send_key(&self, key: &str) {
        if let Err(e) = self.driver.send_key(&self.session_name, key).await {
            warn!(id = %self.id, %key, error = %e, "send_key failed");
        }
        *self.shared.last_activity.lock().unwrap() = Instant::now();
    }

    /// Forward literal text
    pub async fn send_literal(&self, text: &str) {
        if let Err(e) = self.driver.send_literal(&self.session_name, text).await {
            warn!(id = %self.id, error = %e, "send_literal failed");
        }
        *self.shared.last_activity.lock().unwrap() = Instant::now();
    }

    /// Forward text with bracketed-paste framing
    pub async fn send_paste(&self, text: &str) {
        if let Err(e) = self.driver.send_paste(&self.session_name, text).await {
            warn!(id = %self.id, error = %e, "send_paste failed");
        }
        *self.shared.last_activity.lock().unwrap() = Instant::now();
    }

    /// Resize the underlying session
    pub async fn resize(&self, cols: u16, rows: u16) {
        if let Err(e) = self.driver.resize(&self.session_name, cols, rows).await {
            warn!(id = %self.id, error = %e, "resize failed");
        }
    }

    /// Current captured buffer
    pub fn output(&self) -> String {
        self.shared.output.lock().unwrap().clone()
    }

    /// Last classified agent state
    pub fn current_state(&self) -> AgentState {
        *self.shared.state.lock().unwrap()
    }

    /// Error recorded by a failed capture, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    /// Whether the capture loop is live
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the driver session exists right now
    pub async fn session_exists(&self) -> bool {
        self.driver.session_exists(&self.session_name).await
    }

    /// Reset timeout counters and state after a user-initiated restart
    pub fn clear_timeout(&self) {
        debug!(id = %self.id, "InstanceManager::clear_timeout");
        self.shared.reset_timers();
        *self.shared.state.lock().unwrap() = AgentState::Working;
    }
}

/// Publish a timeout event exactly once per kind until cleared
fn fire_timeout(shared: &Shared, bus: &EventBus, id: &str, kind: TimeoutKind) {
    let mut fired = shared.fired.lock().unwrap();
    if fired.insert(kind) {
        info!(%id, ?kind, "Instance timeout");
        bus.publish(Event::InstanceTimeout {
            instance_id: id.to_string(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{FakeDriver, session_name};
    use crate::events::Topic;
    use std::path::PathBuf;

    const TEST_TICK: Duration = Duration::from_millis(10);

    fn spec(name: &str) -> SessionSpec {
        SessionSpec {
            name: name.to_string(),
            cwd: PathBuf::from("/tmp"),
            command: "agent".to_string(),
            cols: 80,
            rows: 24,
        }
    }

    fn manager(id: &str, driver: Arc<FakeDriver>, bus: Arc<EventBus>, policy: TimeoutPolicy) -> InstanceManager {
        InstanceManager::new(id, session_name(id), driver as Arc<dyn TerminalDriver>, bus, policy).with_tick(TEST_TICK)
    }

    async fn settle() {
        tokio::time::sleep(TEST_TICK * 5).await;
    }

    #[tokio::test]
    async fn test_start_captures_output() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());

        mgr.start(spec(&session_name("i1"))).await.unwrap();
        driver.set_frame(&session_name("i1"), "compiling...\n");
        settle().await;

        assert!(mgr.running());
        assert_eq!(mgr.output(), "compiling...\n");
        assert_eq!(mgr.current_state(), AgentState::Working);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut first = manager("i1", driver.clone(), bus.clone(), TimeoutPolicy::default());
        first.start(spec(&session_name("i1"))).await.unwrap();

        let mut second = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        let err = second.start(spec(&session_name("i1"))).await.unwrap_err();
        assert!(matches!(err, DriverError::SessionExists(_)));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_state_transition_to_completed() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();

        driver.set_frame(&session_name("i1"), "working on it\n");
        settle().await;
        assert_eq!(mgr.current_state(), AgentState::Working);

        driver.set_frame(&session_name("i1"), "Task complete\nSummary of changes\n");
        settle().await;
        assert_eq!(mgr.current_state(), AgentState::Completed);

        // Sticky: later frames do not unset completion
        driver.set_frame(&session_name("i1"), "shell prompt\n> ");
        settle().await;
        assert_eq!(mgr.current_state(), AgentState::Completed);
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_stale_timeout_fires_once() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(Topic::InstanceTimeout);
        let policy = TimeoutPolicy {
            stale: Some(Duration::from_millis(40)),
            ..Default::default()
        };
        let mut mgr = manager("i1", driver.clone(), bus.clone(), policy);
        mgr.start(spec(&session_name("i1"))).await.unwrap();
        driver.set_frame(&session_name("i1"), "stuck output\n");

        tokio::time::sleep(Duration::from_millis(150)).await;

        let event = sub.rx.try_recv().expect("stale timeout published");
        assert_eq!(
            event,
            Event::InstanceTimeout {
                instance_id: "i1".to_string(),
                kind: TimeoutKind::Stale,
            }
        );
        // Only fired once
        assert!(sub.rx.try_recv().is_err());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_clear_timeout_allows_refire() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(Topic::InstanceTimeout);
        let policy = TimeoutPolicy {
            stale: Some(Duration::from_millis(40)),
            ..Default::default()
        };
        let mut mgr = manager("i1", driver.clone(), bus.clone(), policy);
        mgr.start(spec(&session_name("i1"))).await.unwrap();
        driver.set_frame(&session_name("i1"), "stuck\n");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sub.rx.try_recv().is_ok());

        mgr.clear_timeout();
        assert_eq!(mgr.current_state(), AgentState::Working);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sub.rx.try_recv().is_ok(), "timeout can fire again after clear");
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_pause_suspends_capture_resume_restores() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();
        driver.set_frame(&session_name("i1"), "before pause\n");
        settle().await;

        mgr.pause();
        settle().await;
        driver.set_frame(&session_name("i1"), "during pause\n");
        settle().await;
        // Paused: the new frame was not captured
        assert_eq!(mgr.output(), "before pause\n");

        mgr.resume(true);
        settle().await;
        assert_eq!(mgr.output(), "during pause\n");
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_resume_without_reset_keeps_stale_window() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(Topic::InstanceTimeout);
        let policy = TimeoutPolicy {
            stale: Some(Duration::from_millis(150)),
            ..Default::default()
        };
        let mut mgr = manager("i1", driver.clone(), bus.clone(), policy);
        mgr.start(spec(&session_name("i1"))).await.unwrap();
        driver.set_frame(&session_name("i1"), "quiet output\n");
        tokio::time::sleep(Duration::from_millis(60)).await;

        mgr.pause();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sub.rx.try_recv().is_err(), "nothing fires while paused");

        // Resuming into a non-Working status keeps the pre-pause window;
        // the stale bound is already crossed, so the timeout fires promptly
        mgr.resume(false);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sub.rx.try_recv().is_ok());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_kills_session() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();

        mgr.stop().await;
        assert!(!mgr.running());
        assert!(!driver.session_exists(&session_name("i1")).await);

        // Second stop is a no-op
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_capture_failure_marks_error() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();
        settle().await;

        // Session dies underneath the capture loop
        driver.kill_session(&session_name("i1")).await.unwrap();
        settle().await;

        assert_eq!(mgr.current_state(), AgentState::Error);
        assert!(!mgr.running());
        assert!(mgr.last_error().is_some());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_send_errors_swallowed() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        // No session was ever created; sends must not panic or error out
        mgr.send_key("Enter").await;
        mgr.send_literal("hello").await;
        mgr.send_paste("block").await;
    }

    #[tokio::test]
    async fn test_bell_published_once_per_ring() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe(Topic::InstanceBell);
        let mut mgr = manager("i1", driver.clone(), bus.clone(), TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();

        driver.set_frame(&session_name("i1"), "ding\u{7}\n");
        settle().await;

        let event = sub.rx.try_recv().expect("bell published");
        assert_eq!(
            event,
            Event::InstanceBell {
                instance_id: "i1".to_string()
            }
        );

        // The same bell in an unchanged buffer does not re-fire
        settle().await;
        assert!(sub.rx.try_recv().is_err());
        mgr.stop().await;
    }

    #[tokio::test]
    async fn test_input_recorded_through_manager() {
        let driver = FakeDriver::new();
        let bus = Arc::new(EventBus::new());
        let mut mgr = manager("i1", driver.clone(), bus, TimeoutPolicy::default());
        mgr.start(spec(&session_name("i1"))).await.unwrap();

        mgr.send_key("Enter").await;
        mgr.send_paste("pasted text").await;

        let sent = driver.sent(&session_name("i1"));
        assert_eq!(sent.len(), 2);
        mgr.stop().await;
    }
}
