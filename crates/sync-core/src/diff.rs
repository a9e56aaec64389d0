//! Three-way manifest comparison.
//!
//! Compares the freshly scanned local manifest against the relay's manifest,
//! using the previously persisted local manifest to tell "deleted here" apart
//! from "never downloaded".

use crate::manifest::{FileInfo, Manifest};
use std::collections::BTreeSet;
use tracing::warn;

/// Classified paths for one sync cycle. The five action sets are disjoint
/// and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub to_upload: Vec<String>,
    pub to_download: Vec<String>,
    pub conflicts: Vec<String>,
    pub to_delete_local: Vec<String>,
    pub to_delete_remote: Vec<String>,
    /// Present on both sides with identical content
    pub unchanged: Vec<String>,
}

impl ManifestDiff {
    /// True when there is nothing to transfer or delete.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Number of paths that need an action.
    pub fn total(&self) -> usize {
        self.to_upload.len()
            + self.to_download.len()
            + self.conflicts.len()
            + self.to_delete_local.len()
            + self.to_delete_remote.len()
    }
}

/// Classify every path in `local` ∪ `remote`.
pub fn diff(local: &Manifest, remote: &Manifest, previous: Option<&Manifest>) -> ManifestDiff {
    let mut result = ManifestDiff::default();

    let paths: BTreeSet<&String> = local.files.keys().chain(remote.files.keys()).collect();

    for path in paths {
        match (local.files.get(path), remote.files.get(path)) {
            (Some(l), None) => {
                if l.synced_at.is_some() {
                    result.to_delete_local.push(path.clone());
                } else {
                    result.to_upload.push(path.clone());
                }
            }
            (None, Some(_)) => {
                let deleted_here = previous
                    .and_then(|p| p.files.get(path))
                    .is_some_and(|p| p.synced_at.is_some());
                if deleted_here {
                    result.to_delete_remote.push(path.clone());
                } else {
                    result.to_download.push(path.clone());
                }
            }
            (Some(l), Some(r)) => {
                if l.hash == r.hash {
                    result.unchanged.push(path.clone());
                    continue;
                }
                match classify_changed(path, l, r) {
                    Side::Both => result.conflicts.push(path.clone()),
                    Side::Local => result.to_upload.push(path.clone()),
                    Side::Remote => result.to_download.push(path.clone()),
                }
            }
            (None, None) => {}
        }
    }

    result
}

enum Side {
    Local,
    Remote,
    Both,
}

fn classify_changed(path: &str, local: &FileInfo, remote: &FileInfo) -> Side {
    let local_changed = match local.synced_at {
        None => true,
        Some(synced) => local.modified_at > synced,
    };
    let remote_changed = remote.modified_at > local.synced_at.unwrap_or(0);

    match (local_changed, remote_changed) {
        (true, true) => Side::Both,
        (true, false) => Side::Local,
        (false, true) => Side::Remote,
        (false, false) => {
            // Content differs yet neither side looks edited (clock skew, touched files).
            // No local edit since the last confirmed sync, so take the remote copy.
            warn!(
                "{}: hashes differ but neither side changed (local mtime {}, remote mtime {}, synced {:?}); downloading",
                path, local.modified_at, remote.modified_at, local.synced_at
            );
            Side::Remote
        }
    }
}
