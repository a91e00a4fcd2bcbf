//! Sync planner: diff two listings under a policy into an ordered plan.
//!
//! `build` is a pure function over its inputs. Identical listings and
//! policy produce an identical plan, and the emitted order guarantees no
//! write references a missing parent and no delete races its own upload:
//! EnsureDirectories, then uploads, then downloads, then deletes (remote
//! before local), lexicographic within each group.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{ancestors_of, EntryKind, FileMeta, VaultId};

use super::policy::{ConflictResolution, RemotePolicy};

/// Listing of one side, keyed by normalised vault-relative path.
pub type Listing = BTreeMap<String, FileMeta>;

/// Group a listing by path for planning.
pub fn to_listing(metas: Vec<FileMeta>) -> Listing {
    metas
        .into_iter()
        .map(|meta| (meta.rel_path.clone(), meta))
        .collect()
}

/// A single atomic sync step.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Directory prefixes missing from a side that will receive writes.
    EnsureDirectories { dirs: Vec<String> },
    Upload {
        key: String,
        local: FileMeta,
    },
    Download {
        key: String,
        remote: FileMeta,
        free_after_download: bool,
    },
    DeleteRemote {
        key: String,
        remote: FileMeta,
    },
    DeleteLocal {
        key: String,
        local: FileMeta,
    },
}

impl Action {
    pub fn key(&self) -> &str {
        match self {
            Action::EnsureDirectories { .. } => "/",
            Action::Upload { key, .. }
            | Action::Download { key, .. }
            | Action::DeleteRemote { key, .. }
            | Action::DeleteLocal { key, .. } => key,
        }
    }
}

/// A path present on both sides with diverging content, left for
/// out-of-band resolution under the Ask policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub vault_id: VaultId,
    pub path: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
}

/// Ordered action sequence for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub conflicts: Vec<Conflict>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Total bytes the plan would upload, before encryption overhead.
    pub fn upload_bytes(&self) -> u64 {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Upload { local, .. } => Some(local.size),
                _ => None,
            })
            .sum()
    }

    pub fn upload_files(&self) -> u64 {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::Upload { .. }))
            .count() as u64
    }

    pub fn download_bytes(&self) -> u64 {
        self.actions
            .iter()
            .filter_map(|a| match a {
                Action::Download { remote, .. } => Some(remote.size),
                _ => None,
            })
            .sum()
    }
}

/// Build the plan for one cycle from the two listings and the policy.
pub fn build(local: &Listing, remote: &Listing, policy: &RemotePolicy) -> Plan {
    let mut uploads: Vec<Action> = Vec::new();
    let mut downloads: Vec<Action> = Vec::new();
    let mut delete_remote: Vec<Action> = Vec::new();
    let mut delete_local: Vec<Action> = Vec::new();
    let mut conflicts: Vec<Conflict> = Vec::new();

    let local_dirs = known_dirs(local);
    let remote_dirs = known_dirs(remote);
    let mut ensure_dirs: BTreeSet<String> = BTreeSet::new();

    let mut keys: BTreeSet<&String> = BTreeSet::new();
    keys.extend(local.keys());
    keys.extend(remote.keys());

    for key in keys {
        let local_file = local.get(key).filter(|m| m.kind == EntryKind::File);
        let remote_file = remote.get(key).filter(|m| m.kind == EntryKind::File);

        match (local_file, remote_file) {
            (Some(l), None) => {
                if local.contains_key(key) && remote.contains_key(key) {
                    // Kind mismatch across sides; left to conflict handling
                    // on a later cycle once one side changes.
                    continue;
                }
                if policy.upload_local_only() {
                    for dir in ancestors_of(key) {
                        if !remote_dirs.contains(&dir) {
                            ensure_dirs.insert(dir);
                        }
                    }
                    uploads.push(Action::Upload {
                        key: key.clone(),
                        local: l.clone(),
                    });
                } else if policy.delete_local_leftovers() {
                    delete_local.push(Action::DeleteLocal {
                        key: key.clone(),
                        local: l.clone(),
                    });
                }
            }
            (None, Some(r)) => {
                if local.contains_key(key) && remote.contains_key(key) {
                    continue;
                }
                if policy.download_remote_only() {
                    for dir in ancestors_of(key) {
                        if !local_dirs.contains(&dir) {
                            ensure_dirs.insert(dir);
                        }
                    }
                    downloads.push(Action::Download {
                        key: key.clone(),
                        remote: r.clone(),
                        free_after_download: policy.free_after_download(),
                    });
                } else if policy.delete_remote_leftovers() {
                    delete_remote.push(Action::DeleteRemote {
                        key: key.clone(),
                        remote: r.clone(),
                    });
                }
            }
            (Some(l), Some(r)) => match policy.decide_for_both(l, r) {
                None => {}
                Some(ConflictResolution::UploadLocal) => {
                    uploads.push(Action::Upload {
                        key: key.clone(),
                        local: l.clone(),
                    });
                }
                Some(ConflictResolution::DownloadRemote) => {
                    downloads.push(Action::Download {
                        key: key.clone(),
                        remote: r.clone(),
                        free_after_download: policy.free_after_download(),
                    });
                }
                Some(ConflictResolution::Unresolved) => {
                    conflicts.push(Conflict {
                        vault_id: policy.vault_id,
                        path: key.clone(),
                        local_hash: l.hash.clone(),
                        remote_hash: r.hash.clone(),
                    });
                }
            },
            (None, None) => {}
        }
    }

    let mut actions = Vec::new();
    if policy.wants_ensure_directories() && !ensure_dirs.is_empty() {
        actions.push(Action::EnsureDirectories {
            dirs: ensure_dirs.into_iter().collect(),
        });
    }
    actions.extend(uploads);
    actions.extend(downloads);
    actions.extend(delete_remote);
    actions.extend(delete_local);

    Plan { actions, conflicts }
}

/// Directory paths visible on one side: explicit directory entries plus
/// every ancestor of a listed path.
fn known_dirs(listing: &Listing) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for (path, meta) in listing {
        if meta.kind == EntryKind::Directory {
            dirs.insert(path.clone());
        }
        for dir in ancestors_of(path) {
            dirs.insert(dir);
        }
    }
    dirs
}
