//! Conflict detection across live worktrees
//!
//! Two instances whose modified-file sets intersect on a path are in
//! conflict. Conflicts are a snapshot per poll, not a stream; the UI reads
//! the latest snapshot each tick.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::vcs::GitBackend;

/// A path modified by more than one live worktree at the same time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub relative_path: String,
    /// Instances touching the path, in instance order
    pub instance_ids: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

/// Snapshot-based conflict detector
#[derive(Debug, Default)]
pub struct ConflictDetector {
    /// Path prefixes excluded from detection (artifact dirs and similar noise)
    excludes: Vec<String>,
    conflicts: Vec<Conflict>,
}

impl ConflictDetector {
    pub fn new(excludes: Vec<String>) -> Self {
        Self {
            excludes,
            conflicts: Vec::new(),
        }
    }

    /// Latest snapshot
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Replace the snapshot with freshly computed conflicts
    pub fn update(&mut self, conflicts: Vec<Conflict>) {
        self.conflicts = conflicts;
    }

    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }
}

/// Collect modified files per live worktree and intersect them
///
/// Runs on a background task; worktrees that fail to report are skipped for
/// this poll rather than failing the scan.
pub async fn scan_conflicts(
    git: &GitBackend,
    live_worktrees: &[(String, PathBuf)],
    excludes: &[String],
) -> Vec<Conflict> {
    let mut modified: Vec<(String, Vec<String>)> = Vec::new();
    for (instance_id, path) in live_worktrees {
        match git.modified_files(path).await {
            Ok(files) => modified.push((instance_id.clone(), files)),
            Err(e) => {
                debug!(%instance_id, error = %e, "scan_conflicts: skipping worktree");
            }
        }
    }
    intersect(&modified, excludes, Utc::now())
}

/// Pure intersection of per-instance modified-file sets
pub fn intersect(modified: &[(String, Vec<String>)], excludes: &[String], now: DateTime<Utc>) -> Vec<Conflict> {
    // BTreeMap keeps conflict output stable across polls
    let mut by_path: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (instance_id, files) in modified {
        for file in files {
            if excludes.iter().any(|prefix| file.starts_with(prefix)) {
                continue;
            }
            by_path.entry(file).or_default().push(instance_id);
        }
    }

    by_path
        .into_iter()
        .filter(|(_, ids)| ids.len() >= 2)
        .map(|(path, ids)| Conflict {
            relative_path: path.to_string(),
            instance_ids: ids.into_iter().map(String::from).collect(),
            last_modified: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(data: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        data.iter()
            .map(|(id, files)| (id.to_string(), files.iter().map(|f| f.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_no_overlap_no_conflicts() {
        let modified = sets(&[("a", &["src/a.rs"]), ("b", &["src/b.rs"])]);
        assert!(intersect(&modified, &[], Utc::now()).is_empty());
    }

    #[test]
    fn test_overlap_reported_with_both_instances() {
        let modified = sets(&[
            ("a", &["src/shared.rs", "src/a.rs"]),
            ("b", &["src/shared.rs"]),
            ("c", &["src/c.rs"]),
        ]);
        let conflicts = intersect(&modified, &[], Utc::now());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].relative_path, "src/shared.rs");
        assert_eq!(conflicts[0].instance_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_three_way_conflict() {
        let modified = sets(&[("a", &["x"]), ("b", &["x"]), ("c", &["x"])]);
        let conflicts = intersect(&modified, &[], Utc::now());
        assert_eq!(conflicts[0].instance_ids.len(), 3);
    }

    #[test]
    fn test_excluded_prefix_ignored() {
        let modified = sets(&[("a", &[".claudio/plan.yaml", "src/x.rs"]), ("b", &[".claudio/plan.yaml"])]);
        let conflicts = intersect(&modified, &[".claudio/".to_string()], Utc::now());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_conflict_set_matches_definition() {
        // {(p, S) : |S| >= 2 and every i in S modified p}
        let modified = sets(&[("a", &["p", "q"]), ("b", &["p"]), ("c", &["q"]), ("d", &["r"])]);
        let conflicts = intersect(&modified, &[], Utc::now());
        let paths: Vec<&str> = conflicts.iter().map(|c| c.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["p", "q"]);
    }

    #[test]
    fn test_detector_snapshot_replaced() {
        let mut detector = ConflictDetector::new(vec![]);
        assert!(detector.conflicts().is_empty());

        let modified = sets(&[("a", &["p"]), ("b", &["p"])]);
        detector.update(intersect(&modified, &[], Utc::now()));
        assert_eq!(detector.conflicts().len(), 1);

        detector.update(Vec::new());
        assert!(detector.conflicts().is_empty());
    }
}
