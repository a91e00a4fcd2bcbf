//! Remote-sync policy model and the planner predicates derived from it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{FileMeta, VaultId};

/// How a vault's two sides are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Pull-on-demand with a quota-trimmed local cache.
    Cache,
    /// Bidirectional reconciliation.
    Sync,
    /// Unidirectional toward one side; leftovers on the other are deleted.
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    KeepLocal,
    KeepRemote,
    KeepNewest,
    Ask,
}

/// Direction chosen for a path present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    UploadLocal,
    DownloadRemote,
    /// Ask policy: no action, surface a conflict record.
    Unresolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePolicy {
    pub id: u32,
    pub vault_id: VaultId,
    pub interval_secs: u64,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub strategy: Strategy,
    pub conflict_policy: ConflictPolicy,
    /// Wrap payloads with the vault data key before they leave the host.
    pub encrypt_upstream: bool,
    /// Stable digest over the policy fields, used to detect changes.
    pub config_hash: String,
}

impl RemotePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Recompute the config digest after a field change.
    pub fn rehash_config(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.vault_id.to_le_bytes());
        hasher.update(self.interval_secs.to_le_bytes());
        hasher.update([self.enabled as u8, self.encrypt_upstream as u8]);
        hasher.update(strategy_tag(self.strategy));
        hasher.update(conflict_tag(self.conflict_policy));
        self.config_hash = hex::encode(hasher.finalize());
    }

    /// Mirror direction: `KeepRemote` mirrors toward local, everything else
    /// mirrors toward remote.
    fn mirrors_toward_local(&self) -> bool {
        self.strategy == Strategy::Mirror && self.conflict_policy == ConflictPolicy::KeepRemote
    }

    pub fn wants_ensure_directories(&self) -> bool {
        true
    }

    pub fn upload_local_only(&self) -> bool {
        match self.strategy {
            Strategy::Sync | Strategy::Cache => true,
            Strategy::Mirror => !self.mirrors_toward_local(),
        }
    }

    pub fn download_remote_only(&self) -> bool {
        match self.strategy {
            Strategy::Sync | Strategy::Cache => true,
            Strategy::Mirror => self.mirrors_toward_local(),
        }
    }

    /// Cache mode frees the materialised copy once its reader is done.
    pub fn free_after_download(&self) -> bool {
        self.strategy == Strategy::Cache
    }

    pub fn delete_remote_leftovers(&self) -> bool {
        self.strategy == Strategy::Mirror && !self.mirrors_toward_local()
    }

    pub fn delete_local_leftovers(&self) -> bool {
        self.mirrors_toward_local()
    }

    /// Resolve a path present on both sides. `None` means the contents
    /// agree and no action is needed.
    pub fn decide_for_both(
        &self,
        local: &FileMeta,
        remote: &FileMeta,
    ) -> Option<ConflictResolution> {
        if local.hash.is_some() && local.hash == remote.hash {
            return None;
        }
        Some(match self.conflict_policy {
            ConflictPolicy::KeepLocal => ConflictResolution::UploadLocal,
            ConflictPolicy::KeepRemote => ConflictResolution::DownloadRemote,
            ConflictPolicy::KeepNewest => {
                // Strictly newer remote wins; ties keep the local copy.
                if remote.modified > local.modified {
                    ConflictResolution::DownloadRemote
                } else {
                    ConflictResolution::UploadLocal
                }
            }
            ConflictPolicy::Ask => ConflictResolution::Unresolved,
        })
    }
}

fn strategy_tag(s: Strategy) -> &'static [u8] {
    match s {
        Strategy::Cache => b"cache",
        Strategy::Sync => b"sync",
        Strategy::Mirror => b"mirror",
    }
}

fn conflict_tag(c: ConflictPolicy) -> &'static [u8] {
    match c {
        ConflictPolicy::KeepLocal => b"keep_local",
        ConflictPolicy::KeepRemote => b"keep_remote",
        ConflictPolicy::KeepNewest => b"keep_newest",
        ConflictPolicy::Ask => b"ask",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use chrono::TimeZone;

    fn policy(strategy: Strategy, conflict_policy: ConflictPolicy) -> RemotePolicy {
        let mut p = RemotePolicy {
            id: 1,
            vault_id: 1,
            interval_secs: 60,
            enabled: true,
            last_sync_at: None,
            last_success_at: None,
            strategy,
            conflict_policy,
            encrypt_upstream: false,
            config_hash: String::new(),
        };
        p.rehash_config();
        p
    }

    fn meta(hash: &str, modified_secs: i64) -> FileMeta {
        FileMeta {
            rel_path: "/f".to_string(),
            size: 1,
            modified: Utc.timestamp_opt(modified_secs, 0).unwrap(),
            hash: Some(hash.to_string()),
            kind: EntryKind::File,
        }
    }

    #[test]
    fn config_hash_tracks_field_changes() {
        let a = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
        let mut b = a.clone();
        assert_eq!(a.config_hash, b.config_hash);

        b.interval_secs = 120;
        b.rehash_config();
        assert_ne!(a.config_hash, b.config_hash);
    }

    #[test]
    fn mirror_sets_exactly_one_leftover_flag() {
        for conflict in [
            ConflictPolicy::KeepLocal,
            ConflictPolicy::KeepRemote,
            ConflictPolicy::KeepNewest,
            ConflictPolicy::Ask,
        ] {
            let p = policy(Strategy::Mirror, conflict);
            assert!(p.delete_remote_leftovers() ^ p.delete_local_leftovers());
        }
        let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
        assert!(!p.delete_remote_leftovers() && !p.delete_local_leftovers());
    }

    #[test]
    fn equal_hashes_need_no_action() {
        let p = policy(Strategy::Sync, ConflictPolicy::KeepLocal);
        assert_eq!(p.decide_for_both(&meta("h", 10), &meta("h", 20)), None);
    }

    #[test]
    fn keep_newest_prefers_strictly_newer_and_ties_go_local() {
        let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
        assert_eq!(
            p.decide_for_both(&meta("a", 100), &meta("b", 200)),
            Some(ConflictResolution::DownloadRemote)
        );
        assert_eq!(
            p.decide_for_both(&meta("a", 200), &meta("b", 100)),
            Some(ConflictResolution::UploadLocal)
        );
        assert_eq!(
            p.decide_for_both(&meta("a", 100), &meta("b", 100)),
            Some(ConflictResolution::UploadLocal)
        );
    }

    #[test]
    fn ask_is_unresolved() {
        let p = policy(Strategy::Sync, ConflictPolicy::Ask);
        assert_eq!(
            p.decide_for_both(&meta("a", 1), &meta("b", 2)),
            Some(ConflictResolution::Unresolved)
        );
    }

    #[test]
    fn cache_strategy_frees_downloads() {
        assert!(policy(Strategy::Cache, ConflictPolicy::KeepNewest).free_after_download());
        assert!(!policy(Strategy::Sync, ConflictPolicy::KeepNewest).free_after_download());
    }
}
