//! Instance groups - named ordered collections used by workflows

use serde::{Deserialize, Serialize};

use super::instance::short_id;

/// What kind of workflow a group belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Plan,
    PlanMulti,
    UltraPlan,
    TripleShot,
    Adversarial,
    #[default]
    Generic,
}

/// A named, ordered collection of instance ids
///
/// Groups never silently delete instances; dissolving a group hands its
/// members back to the caller for explicit removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub instance_ids: Vec<String>,
}

impl InstanceGroup {
    /// Create an empty group
    pub fn new(name: impl Into<String>, session_type: SessionType, objective: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            objective: objective.into(),
            session_type,
            instance_ids: Vec::new(),
        }
    }

    /// Append an instance, preserving insertion order; duplicates ignored
    pub fn add_instance(&mut self, instance_id: impl Into<String>) {
        let id = instance_id.into();
        if !self.instance_ids.contains(&id) {
            self.instance_ids.push(id);
        }
    }

    /// Remove an instance id if present
    pub fn remove_instance(&mut self, instance_id: &str) {
        self.instance_ids.retain(|id| id != instance_id);
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instance_ids.iter().any(|id| id == instance_id)
    }

    pub fn len(&self) -> usize {
        self.instance_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
    }
}
