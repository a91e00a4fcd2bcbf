//! Store contracts for policies, operations, sync events and conflicts.
//!
//! The daemon's relational store implements these; the in-memory variant
//! backs tests and single-process deployments. Schema layout is not part
//! of the contract, only the query surface the core needs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::sync::operations::{OpStatus, Operation};
use crate::sync::planner::Conflict;
use crate::sync::policy::RemotePolicy;
use crate::sync::SyncEvent;
use crate::types::VaultId;

/// How many events the store keeps per vault.
const EVENT_HISTORY: usize = 200;

pub trait PolicyStore: Send + Sync {
    fn get(&self, vault_id: VaultId) -> Option<RemotePolicy>;
    fn upsert(&self, policy: RemotePolicy);
    fn delete_for_vault(&self, vault_id: VaultId);
    fn report_started(&self, vault_id: VaultId, at: DateTime<Utc>);
    fn report_success(&self, vault_id: VaultId, at: DateTime<Utc>);
}

pub trait OperationStore: Send + Sync {
    /// Queue an operation; returns its id.
    fn add(&self, op: Operation) -> u64;
    fn pending_for_vault(&self, vault_id: VaultId) -> Vec<Operation>;
    fn mark_in_progress(&self, id: u64);
    fn mark_completed(&self, id: u64, status: OpStatus, error: Option<String>);
    fn operations(&self, vault_id: VaultId) -> Vec<Operation>;
}

/// An Ask conflict awaiting out-of-band resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub vault_id: VaultId,
    pub path: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub observed_at: DateTime<Utc>,
}

pub trait EventStore: Send + Sync {
    /// Insert or update by event id.
    fn upsert(&self, event: SyncEvent);
    fn latest(&self, vault_id: VaultId) -> Option<SyncEvent>;
    fn events(&self, vault_id: VaultId, limit: usize) -> Vec<SyncEvent>;
    /// Record a conflict, refreshing any earlier record for the same path.
    fn record_conflict(&self, conflict: Conflict);
    fn conflicts(&self, vault_id: VaultId) -> Vec<ConflictRecord>;
    fn resolve_conflict(&self, vault_id: VaultId, path: &str);
    fn purge_old_events(&self, vault_id: VaultId);
}

/// In-memory implementation of all three store contracts.
#[derive(Default)]
pub struct MemoryStore {
    policies: Mutex<HashMap<VaultId, RemotePolicy>>,
    operations: Mutex<Vec<Operation>>,
    next_op_id: Mutex<u64>,
    events: Mutex<HashMap<VaultId, Vec<SyncEvent>>>,
    conflicts: Mutex<Vec<ConflictRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyStore for MemoryStore {
    fn get(&self, vault_id: VaultId) -> Option<RemotePolicy> {
        self.policies.lock().get(&vault_id).cloned()
    }

    fn upsert(&self, policy: RemotePolicy) {
        self.policies.lock().insert(policy.vault_id, policy);
    }

    fn delete_for_vault(&self, vault_id: VaultId) {
        self.policies.lock().remove(&vault_id);
    }

    fn report_started(&self, vault_id: VaultId, at: DateTime<Utc>) {
        if let Some(policy) = self.policies.lock().get_mut(&vault_id) {
            policy.last_sync_at = Some(at);
        }
    }

    fn report_success(&self, vault_id: VaultId, at: DateTime<Utc>) {
        if let Some(policy) = self.policies.lock().get_mut(&vault_id) {
            policy.last_success_at = Some(at);
        }
    }
}

impl OperationStore for MemoryStore {
    fn add(&self, mut op: Operation) -> u64 {
        let mut next = self.next_op_id.lock();
        *next += 1;
        op.id = *next;
        self.operations.lock().push(op);
        *next
    }

    fn pending_for_vault(&self, vault_id: VaultId) -> Vec<Operation> {
        self.operations
            .lock()
            .iter()
            .filter(|o| o.vault_id == vault_id && o.status == OpStatus::Pending)
            .cloned()
            .collect()
    }

    fn mark_in_progress(&self, id: u64) {
        if let Some(op) = self.operations.lock().iter_mut().find(|o| o.id == id) {
            op.status = OpStatus::InProgress;
        }
    }

    fn mark_completed(&self, id: u64, status: OpStatus, error: Option<String>) {
        if let Some(op) = self.operations.lock().iter_mut().find(|o| o.id == id) {
            op.status = status;
            op.error = error;
            op.completed_at = Some(Utc::now());
        }
    }

    fn operations(&self, vault_id: VaultId) -> Vec<Operation> {
        self.operations
            .lock()
            .iter()
            .filter(|o| o.vault_id == vault_id)
            .cloned()
            .collect()
    }
}

impl EventStore for MemoryStore {
    fn upsert(&self, event: SyncEvent) {
        let mut events = self.events.lock();
        let vault_events = events.entry(event.vault_id).or_default();
        match vault_events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => vault_events.push(event),
        }
    }

    fn latest(&self, vault_id: VaultId) -> Option<SyncEvent> {
        self.events
            .lock()
            .get(&vault_id)
            .and_then(|events| events.last().cloned())
    }

    fn events(&self, vault_id: VaultId, limit: usize) -> Vec<SyncEvent> {
        self.events
            .lock()
            .get(&vault_id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn record_conflict(&self, conflict: Conflict) {
        let mut conflicts = self.conflicts.lock();
        let record = ConflictRecord {
            vault_id: conflict.vault_id,
            path: conflict.path,
            local_hash: conflict.local_hash,
            remote_hash: conflict.remote_hash,
            observed_at: Utc::now(),
        };
        match conflicts
            .iter_mut()
            .find(|c| c.vault_id == record.vault_id && c.path == record.path)
        {
            Some(existing) => *existing = record,
            None => conflicts.push(record),
        }
    }

    fn conflicts(&self, vault_id: VaultId) -> Vec<ConflictRecord> {
        self.conflicts
            .lock()
            .iter()
            .filter(|c| c.vault_id == vault_id)
            .cloned()
            .collect()
    }

    fn resolve_conflict(&self, vault_id: VaultId, path: &str) {
        self.conflicts
            .lock()
            .retain(|c| !(c.vault_id == vault_id && c.path == path));
    }

    fn purge_old_events(&self, vault_id: VaultId) {
        let mut events = self.events.lock();
        if let Some(vault_events) = events.get_mut(&vault_id) {
            if vault_events.len() > EVENT_HISTORY {
                let drop = vault_events.len() - EVENT_HISTORY;
                vault_events.drain(..drop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::operations::{OpKind, OpTarget};
    use crate::sync::SyncStatus;

    #[test]
    fn operations_queue_in_order_and_filter_by_status() {
        let store = MemoryStore::new();
        let a = store.add(Operation::new(1, 1, 1, OpKind::Copy, OpTarget::File, "/a", "/b"));
        let b = store.add(Operation::new(1, 2, 1, OpKind::Move, OpTarget::File, "/c", "/d"));
        store.add(Operation::new(2, 3, 1, OpKind::Copy, OpTarget::File, "/x", "/y"));

        let pending = store.pending_for_vault(1);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a);

        store.mark_completed(a, OpStatus::Success, None);
        store.mark_in_progress(b);
        assert!(store.pending_for_vault(1).is_empty());
    }

    #[test]
    fn conflicts_refresh_instead_of_duplicating() {
        let store = MemoryStore::new();
        let conflict = Conflict {
            vault_id: 1,
            path: "/f".to_string(),
            local_hash: Some("a".to_string()),
            remote_hash: Some("b".to_string()),
        };
        store.record_conflict(conflict.clone());
        store.record_conflict(Conflict {
            local_hash: Some("a2".to_string()),
            ..conflict
        });

        let records = store.conflicts(1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].local_hash.as_deref(), Some("a2"));

        store.resolve_conflict(1, "/f");
        assert!(store.conflicts(1).is_empty());
    }

    #[test]
    fn event_history_is_bounded() {
        let store = MemoryStore::new();
        for _ in 0..(EVENT_HISTORY + 10) {
            EventStore::upsert(&store, SyncEvent::started(1));
        }
        store.purge_old_events(1);
        assert_eq!(store.events(1, usize::MAX).len(), EVENT_HISTORY);

        let latest = store.latest(1).unwrap();
        assert_eq!(latest.status, SyncStatus::Running);
    }
}
