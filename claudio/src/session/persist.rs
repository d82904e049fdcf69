//! Session persistence - JSON snapshot and the session lock
//!
//! One JSON document per session. Saves are atomic (write to a temp file,
//! then rename). Loads rebuild indices and migrate legacy records.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::{debug, info, warn};

use super::{InstanceGroup, Session, SessionType};

/// Save a session snapshot atomically
///
/// Captured output is runtime state and is not part of the model, so the
/// snapshot is complete by construction.
pub fn save_session(path: &Path, session: &Session) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create session directory")?;
    }

    let json = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).context("Failed to write session temp file")?;
    fs::rename(&tmp, path).context("Failed to move session file into place")?;

    debug!(?path, instances = session.instances.len(), "save_session: saved");
    Ok(())
}

/// Load a session snapshot, rebuild indices, and migrate legacy records
pub fn load_session(path: &Path) -> Result<Session> {
    let content = fs::read_to_string(path).context("Failed to read session file")?;
    let mut session: Session = serde_json::from_str(&content).context("Failed to parse session file")?;

    session.rebuild_indices();
    migrate_legacy_groups(&mut session);

    info!(?path, instances = session.instances.len(), "Loaded session");
    Ok(session)
}

/// Assign groups to legacy triple-shot/adversarial records that predate
/// group tracking
///
/// Old snapshots carry workflow sub-sessions without a `group_id`; each gets
/// a newly-created group holding its instances.
fn migrate_legacy_groups(session: &mut Session) {
    let mut new_groups = Vec::new();

    for ts in &mut session.triple_shots {
        if ts.group_id.is_empty() {
            let mut group = InstanceGroup::new(
                format!("triple-shot: {}", truncate(&ts.task, 40)),
                SessionType::TripleShot,
                ts.task.clone(),
            );
            for id in ts.instance_ids() {
                group.add_instance(id);
            }
            warn!(group_id = %group.id, "Migrated legacy triple-shot record to group");
            ts.group_id = group.id.clone();
            new_groups.push(group);
        }
    }

    for adv in &mut session.adversarials {
        if adv.group_id.is_empty() {
            let mut group = InstanceGroup::new(
                format!("adversarial: {}", truncate(&adv.task, 40)),
                SessionType::Adversarial,
                adv.task.clone(),
            );
            for id in adv.instance_ids() {
                group.add_instance(id);
            }
            warn!(group_id = %group.id, "Migrated legacy adversarial record to group");
            adv.group_id = group.id.clone();
            new_groups.push(group);
        }
    }

    for group in new_groups {
        session.add_group(group);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Exclusive lock preventing two consoles on one session file
///
/// Created with `O_EXCL` semantics; released on shutdown (or best-effort on
/// drop).
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    released: bool,
}

impl SessionLock {
    /// Acquire the lock, failing if another console holds it
    ///
    /// A lock file whose recorded PID is no longer alive is stale and is
    /// reclaimed automatically.
    pub fn acquire(session_path: &Path) -> Result<Self> {
        let path = session_path.with_extension("lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create session directory")?;
        }

        if path.exists() && !Self::holder_alive(&path) {
            warn!(?path, "SessionLock::acquire: reclaiming stale lock");
            let _ = fs::remove_file(&path);
        }

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                debug!(?path, "SessionLock::acquire: acquired");
                Ok(Self { path, released: false })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(eyre::eyre!(
                "Session is locked by another console ({}). Remove the lock file if that console is gone.",
                path.display()
            )),
            Err(e) => Err(e).context("Failed to create session lock"),
        }
    }

    /// Whether the process recorded in the lock file is still running
    fn holder_alive(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            return true;
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            return true;
        };
        // Signal 0 probes existence without delivering anything
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    /// Release the lock explicitly
    pub fn release(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = ?self.path, error = %e, "SessionLock::release: failed to remove lock file");
            } else {
                debug!(path = ?self.path, "SessionLock::release: released");
            }
            self.released = true;
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release();
    }
}
