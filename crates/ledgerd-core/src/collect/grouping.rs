//! Multimodal grouping.
//!
//! Photos and receipts captured around the same moment describe the same
//! business event. Files whose modification times cluster within the group
//! window and that share a path prefix (same directory) are assigned a
//! common group id; downstream matching treats the group as one unit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A file considered for grouping.
#[derive(Debug, Clone)]
pub struct GroupCandidate {
    /// File path.
    pub path: PathBuf,
    /// Modification time, epoch milliseconds.
    pub modified_at: i64,
}

/// Cluster candidates into groups.
///
/// Only clusters of two or more files get a group id; a lone capture is
/// not a group. Returns a map from path to assigned group id.
#[must_use]
pub fn assign_groups(
    candidates: &[GroupCandidate],
    window_ms: i64,
) -> HashMap<PathBuf, String> {
    let mut by_dir: HashMap<&Path, Vec<&GroupCandidate>> = HashMap::new();
    for candidate in candidates {
        let dir = candidate.path.parent().unwrap_or_else(|| Path::new(""));
        by_dir.entry(dir).or_default().push(candidate);
    }

    let mut groups = HashMap::new();
    for (_, mut members) in by_dir {
        members.sort_by_key(|candidate| candidate.modified_at);

        let mut cluster: Vec<&GroupCandidate> = Vec::new();
        for candidate in members {
            let fits = cluster
                .last()
                .is_some_and(|last| candidate.modified_at - last.modified_at <= window_ms);
            if fits {
                cluster.push(candidate);
            } else {
                flush(&mut groups, &cluster);
                cluster = vec![candidate];
            }
        }
        flush(&mut groups, &cluster);
    }
    groups
}

fn flush(groups: &mut HashMap<PathBuf, String>, cluster: &[&GroupCandidate]) {
    if cluster.len() < 2 {
        return;
    }
    let group_id = uuid::Uuid::new_v4().to_string();
    for member in cluster {
        groups.insert(member.path.clone(), group_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, modified_at: i64) -> GroupCandidate {
        GroupCandidate {
            path: PathBuf::from(path),
            modified_at,
        }
    }

    #[test]
    fn test_burst_in_same_dir_groups() {
        let groups = assign_groups(
            &[
                candidate("/in/receipts/a.jpg", 0),
                candidate("/in/receipts/b.jpg", 30_000),
                candidate("/in/receipts/c.jpg", 55_000),
            ],
            60_000,
        );
        let a = groups.get(Path::new("/in/receipts/a.jpg")).unwrap();
        assert_eq!(groups.get(Path::new("/in/receipts/b.jpg")), Some(a));
        assert_eq!(groups.get(Path::new("/in/receipts/c.jpg")), Some(a));
    }

    #[test]
    fn test_gap_splits_clusters() {
        let groups = assign_groups(
            &[
                candidate("/in/a.jpg", 0),
                candidate("/in/b.jpg", 10_000),
                candidate("/in/c.jpg", 200_000),
                candidate("/in/d.jpg", 210_000),
            ],
            60_000,
        );
        let first = groups.get(Path::new("/in/a.jpg")).unwrap();
        let second = groups.get(Path::new("/in/c.jpg")).unwrap();
        assert_ne!(first, second);
        assert_eq!(groups.get(Path::new("/in/b.jpg")), Some(first));
        assert_eq!(groups.get(Path::new("/in/d.jpg")), Some(second));
    }

    #[test]
    fn test_different_dirs_never_group() {
        let groups = assign_groups(
            &[candidate("/in/x/a.jpg", 0), candidate("/in/y/b.jpg", 1_000)],
            60_000,
        );
        assert!(groups.is_empty());
    }

    #[test]
    fn test_single_file_is_not_a_group() {
        let groups = assign_groups(&[candidate("/in/a.jpg", 0)], 60_000);
        assert!(groups.is_empty());
    }
}
