//! User-initiated FS operations (copy/move/rename) replayed through the
//! remote engine at the head of a sync cycle, before planning.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageEngine;
use crate::store::OperationStore;
use crate::types::{EntryId, EntryKind, UserId, VaultId};
use crate::{Error, Result};

use super::throughput::{Metric, ThroughputSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Copy,
    Move,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpTarget {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: u64,
    pub vault_id: VaultId,
    pub fs_entry_id: EntryId,
    pub executor_user: UserId,
    pub op: OpKind,
    pub target: OpTarget,
    pub status: OpStatus,
    pub source_path: String,
    pub destination_path: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Operation {
    pub fn new(
        vault_id: VaultId,
        fs_entry_id: EntryId,
        executor_user: UserId,
        op: OpKind,
        target: OpTarget,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            vault_id,
            fs_entry_id,
            executor_user,
            op,
            target,
            status: OpStatus::Pending,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            created_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn throughput_metric(&self) -> Metric {
        match self.op {
            OpKind::Copy => Metric::Copy,
            OpKind::Move | OpKind::Rename => Metric::Rename,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    pub replayed: usize,
    pub failed: usize,
}

/// Drain and replay the pending operations for a vault. A failed replay
/// surfaces its error on the record and does not block the cycle; the
/// affected path still participates in planning.
pub async fn replay(
    store: &dyn OperationStore,
    engine: &Arc<dyn StorageEngine>,
    vault_id: VaultId,
    throughput: &mut ThroughputSet,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    for op in store.pending_for_vault(vault_id) {
        store.mark_in_progress(op.id);
        tracing::debug!(
            vault_id,
            op = ?op.op,
            source = %op.source_path,
            destination = %op.destination_path,
            "replaying operation"
        );

        match apply(engine, &op).await {
            Ok(bytes) => {
                throughput.record(op.throughput_metric(), bytes);
                store.mark_completed(op.id, OpStatus::Success, None);
                stats.replayed += 1;
            }
            Err(err) => {
                tracing::warn!(
                    vault_id,
                    op_id = op.id,
                    error = %err,
                    "operation replay failed"
                );
                store.mark_completed(op.id, OpStatus::Failed, Some(err.to_string()));
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

/// Apply one operation with the engine primitives. The contract has no
/// rename, so moves compose a copy with a delete of the source.
async fn apply(engine: &Arc<dyn StorageEngine>, op: &Operation) -> Result<u64> {
    match op.target {
        OpTarget::File => {
            let bytes = copy_file(engine, &op.source_path, &op.destination_path).await?;
            if matches!(op.op, OpKind::Move | OpKind::Rename) {
                engine.delete(&op.source_path).await?;
            }
            Ok(bytes)
        }
        OpTarget::Directory => {
            let listing = engine.list(&op.source_path, true).await?;
            let mut moved = 0u64;

            engine.mkdir(&op.destination_path).await?;
            for meta in &listing {
                let tail = meta
                    .rel_path
                    .strip_prefix(op.source_path.as_str())
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "listing produced '{}' outside '{}'",
                            meta.rel_path, op.source_path
                        ))
                    })?;
                let dest = format!("{}{}", op.destination_path, tail);
                match meta.kind {
                    EntryKind::Directory => engine.mkdir(&dest).await?,
                    EntryKind::File => {
                        moved += copy_file(engine, &meta.rel_path, &dest).await?;
                    }
                }
            }

            if matches!(op.op, OpKind::Move | OpKind::Rename) {
                // Files first, then directories deepest-first, then the root.
                for meta in listing.iter().filter(|m| m.kind == EntryKind::File) {
                    engine.delete(&meta.rel_path).await?;
                }
                let mut dirs: Vec<&str> = listing
                    .iter()
                    .filter(|m| m.kind == EntryKind::Directory)
                    .map(|m| m.rel_path.as_str())
                    .collect();
                dirs.sort_unstable_by_key(|b| std::cmp::Reverse(b.len()));
                for dir in dirs {
                    engine.delete(dir).await?;
                }
                engine.delete(&op.source_path).await?;
            }
            Ok(moved)
        }
    }
}

async fn copy_file(engine: &Arc<dyn StorageEngine>, source: &str, dest: &str) -> Result<u64> {
    let data = engine.read(source).await?;
    let bytes = data.len() as u64;
    engine.write(dest, data, true).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalDiskEngine;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn StorageEngine>, MemoryStore) {
        let dir = TempDir::new().unwrap();
        let engine: Arc<dyn StorageEngine> =
            Arc::new(LocalDiskEngine::new(dir.path()).unwrap());
        (dir, engine, MemoryStore::new())
    }

    #[tokio::test]
    async fn rename_replays_as_copy_plus_delete() {
        let (_dir, engine, store) = setup().await;
        engine.write("/old.txt", Bytes::from("payload"), false).await.unwrap();

        store.add(Operation::new(
            1, 1, 1,
            OpKind::Rename,
            OpTarget::File,
            "/old.txt",
            "/new.txt",
        ));

        let mut throughput = ThroughputSet::new();
        let stats = replay(&store, &engine, 1, &mut throughput).await.unwrap();
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.failed, 0);

        assert!(!engine.exists("/old.txt").await.unwrap());
        assert_eq!(engine.read("/new.txt").await.unwrap(), Bytes::from("payload"));
        assert_eq!(throughput.get(Metric::Rename).unwrap().num_ops, 1);
    }

    #[tokio::test]
    async fn copy_keeps_the_source() {
        let (_dir, engine, store) = setup().await;
        engine.write("/a.txt", Bytes::from("x"), false).await.unwrap();

        store.add(Operation::new(
            1, 1, 1,
            OpKind::Copy,
            OpTarget::File,
            "/a.txt",
            "/b.txt",
        ));

        let mut throughput = ThroughputSet::new();
        replay(&store, &engine, 1, &mut throughput).await.unwrap();

        assert!(engine.exists("/a.txt").await.unwrap());
        assert!(engine.exists("/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn directory_move_carries_the_whole_subtree() {
        let (_dir, engine, store) = setup().await;
        engine.write("/src/a.txt", Bytes::from("a"), false).await.unwrap();
        engine.write("/src/sub/b.txt", Bytes::from("b"), false).await.unwrap();

        store.add(Operation::new(
            1, 1, 1,
            OpKind::Move,
            OpTarget::Directory,
            "/src",
            "/dst",
        ));

        let mut throughput = ThroughputSet::new();
        let stats = replay(&store, &engine, 1, &mut throughput).await.unwrap();
        assert_eq!(stats.replayed, 1);

        assert!(!engine.exists("/src").await.unwrap());
        assert_eq!(engine.read("/dst/a.txt").await.unwrap(), Bytes::from("a"));
        assert_eq!(engine.read("/dst/sub/b.txt").await.unwrap(), Bytes::from("b"));
    }

    #[tokio::test]
    async fn failed_replay_marks_the_record_and_continues() {
        let (_dir, engine, store) = setup().await;
        engine.write("/ok.txt", Bytes::from("fine"), false).await.unwrap();

        store.add(Operation::new(
            1, 1, 1,
            OpKind::Rename,
            OpTarget::File,
            "/missing.txt",
            "/whatever.txt",
        ));
        store.add(Operation::new(
            1, 2, 1,
            OpKind::Rename,
            OpTarget::File,
            "/ok.txt",
            "/moved.txt",
        ));

        let mut throughput = ThroughputSet::new();
        let stats = replay(&store, &engine, 1, &mut throughput).await.unwrap();
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.failed, 1);

        // The failed record carries its error; the second op still ran.
        let failed = store
            .operations(1)
            .into_iter()
            .find(|o| o.status == OpStatus::Failed)
            .unwrap();
        assert!(failed.error.is_some());
        assert!(engine.exists("/moved.txt").await.unwrap());
    }
}
