//! Plan model - the decomposition emitted by planning instances
//!
//! A plan is a DAG of typed tasks. Validation rejects cycles and dangling
//! dependency references; execution order layers the DAG into groups of
//! tasks that can run in parallel.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error types for plan validation and parsing
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Plan has no tasks")]
    Empty,

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dep}")]
    UnknownDependency { task: String, dep: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Failed to parse plan: {0}")]
    Parse(String),
}

/// Task complexity estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// One task within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    /// Stable task id, unique within the plan
    pub id: String,

    /// Short title
    pub title: String,

    /// Full description handed to the executing agent
    #[serde(default)]
    pub description: String,

    /// Files the task is expected to touch
    #[serde(default)]
    pub files: Vec<String>,

    /// Task ids that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Relative priority within a layer (higher runs earlier)
    #[serde(default)]
    pub priority: u32,

    /// Complexity estimate
    #[serde(default)]
    pub complexity: Complexity,
}

/// A full plan: objective, summary, and the task DAG
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanSpec {
    /// What the plan is trying to achieve
    pub objective: String,

    /// Planner's summary of the approach
    #[serde(default)]
    pub summary: String,

    /// Ordered tasks
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

impl PlanSpec {
    /// Parse a plan from YAML and validate it
    pub fn from_yaml(content: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_yaml::from_str(content).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Ids of all tasks, in plan order
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Validate uniqueness, referential integrity, and acyclicity
    ///
    /// Plan edits must re-validate before use.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        validate_acyclic(&self.tasks)
    }

    /// Topological layering of the task DAG
    ///
    /// Layer N contains every task whose dependencies are all in layers
    /// < N. Layers are disjoint and their union is the full task set; tasks
    /// within a layer can execute in parallel. Within a layer, tasks are
    /// ordered by descending priority then plan order.
    pub fn execution_order(&self) -> Result<Vec<Vec<String>>, PlanError> {
        self.validate()?;

        let index: HashMap<&str, usize> = self.tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();
        let mut remaining_deps: Vec<HashSet<usize>> = self
            .tasks
            .iter()
            .map(|t| t.depends_on.iter().map(|d| index[d.as_str()]).collect())
            .collect();

        let mut placed = vec![false; self.tasks.len()];
        let mut layers = Vec::new();

        while placed.iter().any(|&p| !p) {
            let mut layer: Vec<usize> = (0..self.tasks.len())
                .filter(|&i| !placed[i] && remaining_deps[i].is_empty())
                .collect();
            debug_assert!(!layer.is_empty(), "validated DAG must always yield a ready layer");

            layer.sort_by(|&a, &b| {
                self.tasks[b]
                    .priority
                    .cmp(&self.tasks[a].priority)
                    .then_with(|| a.cmp(&b))
            });

            for &i in &layer {
                placed[i] = true;
            }
            for deps in remaining_deps.iter_mut() {
                for &i in &layer {
                    deps.remove(&i);
                }
            }

            layers.push(layer.into_iter().map(|i| self.tasks[i].id.clone()).collect());
        }

        debug!(task_count = self.tasks.len(), layer_count = layers.len(), "execution_order");
        Ok(layers)
    }
}

/// Cycle detection over the task DAG using DFS with a recursion stack
fn validate_acyclic(tasks: &[PlanTask]) -> Result<(), PlanError> {
    let task_map: HashMap<&str, &PlanTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for id in task_map.keys() {
        if !visited.contains(id) && has_cycle_dfs(id, &task_map, &mut visited, &mut rec_stack, &mut cycle_path) {
            return Err(PlanError::Cycle(cycle_path));
        }
    }
    Ok(())
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a PlanTask>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(task) = graph.get(node) {
        for dep in &task.depends_on {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str())
                    && has_cycle_dfs(dep.as_str(), graph, visited, rec_stack, cycle_path)
                {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                cycle_path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}
