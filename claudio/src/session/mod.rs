//! Session model - the top-level persistent container
//!
//! A session owns the ordered instance list, the groups, and the workflow
//! sub-sessions for one base repository. Cross-links are stored as ids;
//! O(1) lookups go through indices rebuilt on load.

mod group;
mod instance;
mod persist;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflows::{AdversarialSession, MultiPlanSession, TripleShotSession, UltraPlanSession};

pub use group::{InstanceGroup, SessionType};
pub use instance::{IllegalTransition, Instance, InstanceMetrics, InstanceStatus, short_id};
pub use persist::{SessionLock, load_session, save_session};

/// Error types for session mutations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("Worktree path already owned by a live instance: {0}")]
    WorktreeInUse(String),

    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
}

/// Aggregated fleet metrics for the stats panel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub total: usize,
    pub working: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub api_calls: u64,
}

/// The persistent in-memory model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub base_repo: PathBuf,

    /// Ordered instances; order is display order
    #[serde(default)]
    pub instances: Vec<Instance>,

    #[serde(default)]
    pub groups: Vec<InstanceGroup>,

    /// At most one active ultra-plan pipeline
    #[serde(default)]
    pub ultra_plan: Option<UltraPlanSession>,

    #[serde(default)]
    pub triple_shots: Vec<TripleShotSession>,

    #[serde(default)]
    pub adversarials: Vec<AdversarialSession>,

    /// Standalone multi-plan competitions
    #[serde(default)]
    pub inline_plans: Vec<MultiPlanSession>,

    #[serde(skip)]
    instance_index: HashMap<String, usize>,

    #[serde(skip)]
    group_index: HashMap<String, usize>,
}

impl Session {
    /// Create an empty session for a repository
    pub fn new(name: impl Into<String>, base_repo: impl Into<PathBuf>) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            created_at: Utc::now(),
            base_repo: base_repo.into(),
            instances: Vec::new(),
            groups: Vec::new(),
            ultra_plan: None,
            triple_shots: Vec::new(),
            adversarials: Vec::new(),
            inline_plans: Vec::new(),
            instance_index: HashMap::new(),
            group_index: HashMap::new(),
        }
    }

    /// Rebuild the id → position indices (call after load or bulk edits)
    pub fn rebuild_indices(&mut self) {
        self.instance_index = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.id.clone(), i))
            .collect();
        self.group_index = self.groups.iter().enumerate().map(|(i, g)| (g.id.clone(), i)).collect();
    }

    // === Instances ===

    /// Append an instance
    ///
    /// Rejects duplicate ids and worktree paths already owned by a live
    /// instance.
    pub fn add_instance(&mut self, instance: Instance) -> Result<(), SessionError> {
        if self.instance_index.contains_key(&instance.id) {
            return Err(SessionError::DuplicateInstance(instance.id));
        }
        if self.instances.iter().any(|i| i.worktree_path == instance.worktree_path) {
            return Err(SessionError::WorktreeInUse(instance.worktree_path.display().to_string()));
        }
        self.instance_index.insert(instance.id.clone(), self.instances.len());
        self.instances.push(instance);
        Ok(())
    }

    /// Remove an instance and drop it from every group
    pub fn remove_instance(&mut self, id: &str) -> Option<Instance> {
        let pos = self.instance_index.remove(id)?;
        let instance = self.instances.remove(pos);
        for group in &mut self.groups {
            group.remove_instance(id);
        }
        self.rebuild_indices();
        Some(instance)
    }

    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instance_index.get(id).map(|&i| &self.instances[i])
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        let i = *self.instance_index.get(id)?;
        Some(&mut self.instances[i])
    }

    pub fn instance_status(&self, id: &str) -> Option<InstanceStatus> {
        self.instance(id).map(|i| i.status)
    }

    /// Add a dependency edge, rejecting cycles at add time
    pub fn add_dependency(&mut self, child: &str, parent: &str) -> Result<(), SessionError> {
        if self.instance(parent).is_none() {
            return Err(SessionError::UnknownInstance(parent.to_string()));
        }
        if self.instance(child).is_none() {
            return Err(SessionError::UnknownInstance(child.to_string()));
        }

        // Would parent -> ... -> child close a loop with the new child -> parent edge?
        if child == parent || self.reachable(parent, child) {
            return Err(SessionError::DependencyCycle(vec![
                child.to_string(),
                parent.to_string(),
                child.to_string(),
            ]));
        }

        let inst = self.instance_mut(child).ok_or_else(|| SessionError::UnknownInstance(child.to_string()))?;
        if !inst.depends_on.iter().any(|d| d == parent) {
            inst.depends_on.push(parent.to_string());
        }
        Ok(())
    }

    /// DFS over dependency edges: is `to` reachable from `from`?
    fn reachable(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id.to_string()) {
                continue;
            }
            if let Some(inst) = self.instance(id) {
                for dep in &inst.depends_on {
                    stack.push(dep);
                }
            }
        }
        false
    }

    // === Groups ===

    pub fn add_group(&mut self, group: InstanceGroup) -> &mut InstanceGroup {
        self.group_index.insert(group.id.clone(), self.groups.len());
        self.groups.push(group);
        self.groups.last_mut().unwrap()
    }

    pub fn group(&self, id: &str) -> Option<&InstanceGroup> {
        self.group_index.get(id).map(|&i| &self.groups[i])
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut InstanceGroup> {
        let i = *self.group_index.get(id)?;
        Some(&mut self.groups[i])
    }

    /// Remove a group and return its member ids for explicit instance removal
    ///
    /// Groups never silently delete instances.
    pub fn dissolve_group(&mut self, id: &str) -> Option<Vec<String>> {
        let pos = self.group_index.remove(id)?;
        let group = self.groups.remove(pos);
        self.rebuild_indices();
        Some(group.instance_ids)
    }

    /// Per-group completion progress (completed / total)
    pub fn group_progress(&self, id: &str) -> Option<(usize, usize)> {
        let group = self.group(id)?;
        let completed = group
            .instance_ids
            .iter()
            .filter(|iid| self.instance_status(iid) == Some(InstanceStatus::Completed))
            .count();
        Some((completed, group.len()))
    }

    // === Metrics ===

    /// Aggregate fleet metrics
    pub fn metrics(&self) -> SessionMetrics {
        let mut m = SessionMetrics {
            total: self.instances.len(),
            ..Default::default()
        };
        for inst in &self.instances {
            match inst.status {
                InstanceStatus::Working | InstanceStatus::CreatingPr => m.working += 1,
                InstanceStatus::WaitingInput => m.waiting += 1,
                InstanceStatus::Completed => m.completed += 1,
                InstanceStatus::Error | InstanceStatus::Stuck | InstanceStatus::Timeout => m.failed += 1,
                InstanceStatus::Pending | InstanceStatus::Paused => {}
            }
            m.tokens_in += inst.metrics.tokens_in;
            m.tokens_out += inst.metrics.tokens_out;
            m.cost_usd += inst.metrics.cost_usd;
            m.api_calls += inst.metrics.api_calls;
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn session() -> Session {
        Session::new("test", "/repo")
    }

    fn instance(task: &str) -> Instance {
        Instance::new(task, "/repo", Path::new("/tmp/wt"), "claudio")
    }

    #[test]
    fn test_add_and_lookup() {
        let mut s = session();
        let inst = instance("a");
        let id = inst.id.clone();
        s.add_instance(inst).unwrap();
        assert_eq!(s.instance(&id).unwrap().task, "a");
        assert_eq!(s.instance_status(&id), Some(InstanceStatus::Pending));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut s = session();
        let inst = instance("a");
        let dup = inst.clone();
        s.add_instance(inst).unwrap();
        assert!(matches!(s.add_instance(dup), Err(SessionError::DuplicateInstance(_))));
    }

    #[test]
    fn test_duplicate_worktree_rejected() {
        let mut s = session();
        let a = instance("a");
        let mut b = instance("b");
        b.worktree_path = a.worktree_path.clone();
        s.add_instance(a).unwrap();
        assert!(matches!(s.add_instance(b), Err(SessionError::WorktreeInUse(_))));
    }

    #[test]
    fn test_remove_instance_also_leaves_groups() {
        let mut s = session();
        let inst = instance("a");
        let id = inst.id.clone();
        s.add_instance(inst).unwrap();

        let mut group = InstanceGroup::new("g", SessionType::Generic, "");
        group.add_instance(&id);
        let gid = group.id.clone();
        s.add_group(group);

        let removed = s.remove_instance(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(s.instance(&id).is_none());
        assert!(!s.group(&gid).unwrap().contains(&id));
    }

    #[test]
    fn test_indices_stay_valid_after_remove() {
        let mut s = session();
        let a = instance("a");
        let b = instance("b");
        let c = instance("c");
        let (ida, idb, idc) = (a.id.clone(), b.id.clone(), c.id.clone());
        s.add_instance(a).unwrap();
        s.add_instance(b).unwrap();
        s.add_instance(c).unwrap();

        s.remove_instance(&idb);
        assert_eq!(s.instance(&ida).unwrap().task, "a");
        assert_eq!(s.instance(&idc).unwrap().task, "c");
        assert!(s.instance(&idb).is_none());
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut s = session();
        let a = instance("a");
        let b = instance("b");
        let c = instance("c");
        let (ida, idb, idc) = (a.id.clone(), b.id.clone(), c.id.clone());
        s.add_instance(a).unwrap();
        s.add_instance(b).unwrap();
        s.add_instance(c).unwrap();

        s.add_dependency(&idb, &ida).unwrap();
        s.add_dependency(&idc, &idb).unwrap();
        // a -> c would close the loop
        assert!(matches!(
            s.add_dependency(&ida, &idc),
            Err(SessionError::DependencyCycle(_))
        ));
        // Self-dependency rejected
        assert!(matches!(
            s.add_dependency(&ida, &ida),
            Err(SessionError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_dissolve_group_returns_members() {
        let mut s = session();
        let mut group = InstanceGroup::new("g", SessionType::TripleShot, "");
        group.add_instance("x");
        group.add_instance("y");
        let gid = group.id.clone();
        s.add_group(group);

        let members = s.dissolve_group(&gid).unwrap();
        assert_eq!(members, vec!["x", "y"]);
        assert!(s.group(&gid).is_none());
    }

    #[test]
    fn test_group_progress() {
        let mut s = session();
        let a = instance("a");
        let b = instance("b");
        let (ida, idb) = (a.id.clone(), b.id.clone());
        s.add_instance(a).unwrap();
        s.add_instance(b).unwrap();

        let mut group = InstanceGroup::new("g", SessionType::Generic, "");
        group.add_instance(&ida);
        group.add_instance(&idb);
        let gid = group.id.clone();
        s.add_group(group);

        assert_eq!(s.group_progress(&gid), Some((0, 2)));
        let inst = s.instance_mut(&ida).unwrap();
        inst.transition(InstanceStatus::Working).unwrap();
        inst.transition(InstanceStatus::Completed).unwrap();
        assert_eq!(s.group_progress(&gid), Some((1, 2)));
    }

    #[test]
    fn test_metrics_aggregation() {
        let mut s = session();
        let mut a = instance("a");
        a.metrics.tokens_in = 100;
        a.metrics.cost_usd = 0.5;
        let mut b = instance("b");
        b.metrics.tokens_in = 50;
        b.metrics.cost_usd = 0.25;
        s.add_instance(a).unwrap();
        s.add_instance(b).unwrap();

        let m = s.metrics();
        assert_eq!(m.total, 2);
        assert_eq!(m.tokens_in, 150);
        assert!((m.cost_usd - 0.75).abs() < f64::EPSILON);
    }
}
