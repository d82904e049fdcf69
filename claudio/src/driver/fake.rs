//! In-memory driver for tests
//!
//! Captures are served from a scripted frame queue per session; all input is
//! recorded for assertion. Shared across instances via [`DriverFactory`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{DriverError, DriverFactory, SessionSpec, TerminalDriver};

/// Input recorded by the fake driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentInput {
    Key(String),
    Literal(String),
    Paste(String),
}

#[derive(Debug, Default)]
struct FakeSession {
    /// Frames served one per capture; the last frame repeats once drained
    frames: VecDeque<String>,
    current: String,
    sent: Vec<SentInput>,
    cols: u16,
    rows: u16,
}

/// Scriptable in-memory [`TerminalDriver`]
#[derive(Default)]
pub struct FakeDriver {
    sessions: Mutex<HashMap<String, FakeSession>>,
    /// When set, `create_session` fails with this error message
    fail_create: Mutex<Option<String>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a frame to be returned by the next capture of `session`
    pub fn push_frame(&self, session: &str, frame: impl Into<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(session) {
            s.frames.push_back(frame.into());
        }
    }

    /// Replace the current frame immediately (next capture returns it)
    pub fn set_frame(&self, session: &str, frame: impl Into<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(session) {
            s.current = frame.into();
            s.frames.clear();
        }
    }

    /// Everything sent into a session, in order
    pub fn sent(&self, session: &str) -> Vec<SentInput> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(session).map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Session dimensions after the last resize
    pub fn size(&self, session: &str) -> Option<(u16, u16)> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(session).map(|s| (s.cols, s.rows))
    }

    /// All live session names
    pub fn session_names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.keys().cloned().collect()
    }

    /// Make the next `create_session` fail
    pub fn fail_next_create(&self, message: &str) {
        *self.fail_create.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl TerminalDriver for FakeDriver {
    async fn create_session(&self, spec: &SessionSpec) -> Result<(), DriverError> {
        if let Some(message) = self.fail_create.lock().unwrap().take() {
            return Err(DriverError::SpawnFailed(message));
        }
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&spec.name) {
            return Err(DriverError::SessionExists(spec.name.clone()));
        }
        sessions.insert(
            spec.name.clone(),
            FakeSession {
                cols: spec.cols,
                rows: spec.rows,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn send_key(&self, session: &str, key: &str) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))?;
        s.sent.push(SentInput::Key(key.to_string()));
        Ok(())
    }

    async fn send_literal(&self, session: &str, text: &str) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))?;
        s.sent.push(SentInput::Literal(text.to_string()));
        Ok(())
    }

    async fn send_paste(&self, session: &str, text: &str) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))?;
        s.sent.push(SentInput::Paste(text.to_string()));
        Ok(())
    }

    async fn capture(&self, session: &str) -> Result<String, DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))?;
        if let Some(next) = s.frames.pop_front() {
            s.current = next;
        }
        Ok(s.current.clone())
    }

    async fn capture_history(&self, session: &str, _lines: u32) -> Result<String, DriverError> {
        self.capture(session).await
    }

    async fn resize(&self, session: &str, cols: u16, rows: u16) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        let s = sessions
            .get_mut(session)
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))?;
        s.cols = cols;
        s.rows = rows;
        Ok(())
    }

    async fn kill_session(&self, session: &str) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| DriverError::SessionNotFound(session.to_string()))
    }

    async fn session_exists(&self, session: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session)
    }
}

impl DriverFactory for Arc<FakeDriver> {
    /// All fake sessions live on one shared in-memory "server"
    fn driver_for(&self, _instance_id: &str) -> Arc<dyn TerminalDriver> {
        self.clone() as Arc<dyn TerminalDriver>
    }
}
