//! Remote-sync engine
//!
//! Reconciles a vault's local materialised view with its remote side under
//! a declarative policy: operation replay, planning, preflight, bounded
//! execution and per-vault scheduling.

pub mod controller;
pub mod executor;
pub mod operations;
pub mod planner;
pub mod policy;
pub mod preflight;
pub mod throughput;

pub use controller::{SyncController, SyncHealth};
pub use executor::{ExecutorConfig, PlanExecutor, SyncOutcome};
pub use planner::{build, Action, Conflict, Listing, Plan};
pub use policy::{ConflictPolicy, RemotePolicy, Strategy};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::VaultId;
use throughput::Throughput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// One controller cycle, recorded for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub vault_id: VaultId,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub throughput: Vec<Throughput>,
}

impl SyncEvent {
    pub fn started(vault_id: VaultId) -> Self {
        Self {
            id: Uuid::new_v4(),
            vault_id,
            status: SyncStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            throughput: Vec::new(),
        }
    }

    pub fn finish(
        &mut self,
        status: SyncStatus,
        error: Option<String>,
        throughput: Vec<Throughput>,
    ) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.error = error;
        self.throughput = throughput;
    }
}
