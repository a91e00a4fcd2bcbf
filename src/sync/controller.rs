//! Per-vault sync scheduling
//!
//! A control loop owns a priority queue of sync tasks keyed by due time
//! and never blocks on I/O itself; cycles run on worker tasks. At most one
//! sync runs per vault, failures reschedule with exponential backoff
//! capped at the policy interval, and "sync now" pulls a vault forward.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::fscache::FsCache;
use crate::storage::{StorageEngine, StorageManager};
use crate::store::{EventStore, OperationStore, PolicyStore};
use crate::types::{CancelFlag, EntryKind, VaultId};
use crate::{Error, Result};

use super::executor::{ExecutorConfig, PlanExecutor};
use super::operations;
use super::planner::{self, to_listing};
use super::throughput::ThroughputSet;
use super::{SyncEvent, SyncStatus};

/// One queued sync, ordered by due time (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct SyncTask {
    vault_id: VaultId,
    next_due_at: DateTime<Utc>,
}

impl Ord for SyncTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest due wins.
        other
            .next_due_at
            .cmp(&self.next_due_at)
            .then_with(|| other.vault_id.cmp(&self.vault_id))
    }
}

impl PartialOrd for SyncTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Per-vault sync health assembled from the policy and recent cycles.
#[derive(Debug, Clone)]
pub struct SyncHealth {
    pub vault_id: VaultId,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub in_flight: bool,
}

struct ControllerInner {
    storage: Arc<StorageManager>,
    cache: Arc<FsCache>,
    policies: Arc<dyn PolicyStore>,
    operations: Arc<dyn OperationStore>,
    events: Arc<dyn EventStore>,
    executor_config: ExecutorConfig,
    workers: Arc<Semaphore>,
    queue: Mutex<BinaryHeap<SyncTask>>,
    in_flight: Mutex<HashSet<VaultId>>,
    resync_requested: Mutex<HashSet<VaultId>>,
    failures: Mutex<HashMap<VaultId, u32>>,
    cancel_flags: Mutex<HashMap<VaultId, CancelFlag>>,
    notify: Notify,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct SyncController {
    inner: Arc<ControllerInner>,
}

impl SyncController {
    pub fn new(
        storage: Arc<StorageManager>,
        cache: Arc<FsCache>,
        policies: Arc<dyn PolicyStore>,
        operations: Arc<dyn OperationStore>,
        events: Arc<dyn EventStore>,
        sync_workers: usize,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                storage,
                cache,
                policies,
                operations,
                events,
                executor_config,
                workers: Arc::new(Semaphore::new(sync_workers.max(1))),
                queue: Mutex::new(BinaryHeap::new()),
                in_flight: Mutex::new(HashSet::new()),
                resync_requested: Mutex::new(HashSet::new()),
                failures: Mutex::new(HashMap::new()),
                cancel_flags: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Queue every enabled policy and start the control loop.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        for vault in self.inner.storage.vaults() {
            if let Some(policy) = self.inner.policies.get(vault.id) {
                if policy.enabled {
                    self.enqueue_at(vault.id, Utc::now());
                }
            }
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { run_loop(inner).await })
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        for flag in self.inner.cancel_flags.lock().values() {
            flag.cancel();
        }
        self.inner.notify.notify_waiters();
    }

    /// External "sync now": pulls the vault forward, or flags a follow-up
    /// run when a cycle is already in flight.
    pub fn sync_now(&self, vault_id: VaultId) {
        if self.inner.in_flight.lock().contains(&vault_id) {
            self.inner.resync_requested.lock().insert(vault_id);
        } else {
            self.enqueue_at(vault_id, Utc::now());
        }
    }

    /// Cooperative cancellation of a running cycle.
    pub fn cancel(&self, vault_id: VaultId) {
        if let Some(flag) = self.inner.cancel_flags.lock().get(&vault_id) {
            flag.cancel();
        }
    }

    /// Insert or pull forward; a vault appears at most once in the queue.
    pub fn enqueue_at(&self, vault_id: VaultId, due: DateTime<Utc>) {
        {
            let mut queue = self.inner.queue.lock();
            let mut tasks = std::mem::take(&mut *queue).into_vec();
            tasks.retain(|t| t.vault_id != vault_id);
            tasks.push(SyncTask {
                vault_id,
                next_due_at: due,
            });
            *queue = BinaryHeap::from(tasks);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn health(&self, vault_id: VaultId) -> Option<SyncHealth> {
        let policy = self.inner.policies.get(vault_id)?;
        Some(SyncHealth {
            vault_id,
            last_sync_at: policy.last_sync_at,
            last_success_at: policy.last_success_at,
            consecutive_failures: self
                .inner
                .failures
                .lock()
                .get(&vault_id)
                .copied()
                .unwrap_or(0),
            in_flight: self.inner.in_flight.lock().contains(&vault_id),
        })
    }
}

enum NextStep {
    Run(SyncTask),
    Sleep(std::time::Duration),
    Idle,
}

async fn run_loop(inner: Arc<ControllerInner>) {
    tracing::info!("sync controller started");
    while inner.running.load(Ordering::SeqCst) {
        let step = {
            let mut queue = inner.queue.lock();
            match queue.peek() {
                None => NextStep::Idle,
                Some(head) => {
                    let now = Utc::now();
                    if head.next_due_at <= now {
                        NextStep::Run(queue.pop().expect("peeked head exists"))
                    } else {
                        let wait = (head.next_due_at - now)
                            .to_std()
                            .unwrap_or(std::time::Duration::from_secs(1));
                        NextStep::Sleep(wait)
                    }
                }
            }
        };

        match step {
            NextStep::Run(task) => dispatch(&inner, task),
            NextStep::Sleep(wait) => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            NextStep::Idle => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
            }
        }
    }
    tracing::info!("sync controller stopped");
}

/// Hand a due task to a worker. A vault with a cycle in flight is dropped
/// here and rescheduled when that cycle completes.
fn dispatch(inner: &Arc<ControllerInner>, task: SyncTask) {
    let vault_id = task.vault_id;
    {
        let mut in_flight = inner.in_flight.lock();
        if in_flight.contains(&vault_id) {
            return;
        }
        in_flight.insert(vault_id);
    }

    let cancel = CancelFlag::new();
    inner.cancel_flags.lock().insert(vault_id, cancel.clone());

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
            inner.in_flight.lock().remove(&vault_id);
            return;
        };
        let result = run_cycle(&inner, vault_id, cancel).await;
        finish_cycle(&inner, vault_id, result);
    });
}

/// Reschedule after a cycle: the policy interval on success, exponential
/// backoff capped at the interval on failure.
fn finish_cycle(inner: &Arc<ControllerInner>, vault_id: VaultId, result: Result<()>) {
    inner.in_flight.lock().remove(&vault_id);
    inner.cancel_flags.lock().remove(&vault_id);

    let Some(policy) = inner.policies.get(vault_id) else {
        return;
    };
    if !policy.enabled {
        return;
    }
    let interval = policy.interval_secs.max(1);

    let mut next_due = match result {
        Ok(()) => {
            inner.failures.lock().remove(&vault_id);
            inner.policies.report_success(vault_id, Utc::now());
            Utc::now() + TimeDelta::seconds(interval as i64)
        }
        Err(err) => {
            let mut failures = inner.failures.lock();
            let count = failures.entry(vault_id).or_insert(0);
            *count += 1;
            let backoff = backoff_secs(*count, interval);
            tracing::warn!(
                vault_id,
                consecutive_failures = *count,
                backoff_secs = backoff,
                error = %err,
                "sync cycle failed"
            );
            Utc::now() + TimeDelta::seconds(backoff as i64)
        }
    };

    if inner.resync_requested.lock().remove(&vault_id) {
        next_due = Utc::now();
    }

    {
        let mut queue = inner.queue.lock();
        let mut tasks = std::mem::take(&mut *queue).into_vec();
        tasks.retain(|t| t.vault_id != vault_id);
        tasks.push(SyncTask {
            vault_id,
            next_due_at: next_due,
        });
        *queue = BinaryHeap::from(tasks);
    }
    inner.notify.notify_waiters();
}

/// Exponential backoff, capped at the policy interval so a failing vault
/// never starves out of the schedule.
fn backoff_secs(consecutive_failures: u32, interval: u64) -> u64 {
    1u64.checked_shl(consecutive_failures.min(32))
        .unwrap_or(u64::MAX)
        .min(interval)
}

/// One full cycle: replay pending operations, list both sides, plan,
/// preflight, execute, record the event.
async fn run_cycle(
    inner: &Arc<ControllerInner>,
    vault_id: VaultId,
    cancel: CancelFlag,
) -> Result<()> {
    let Some(policy) = inner.policies.get(vault_id) else {
        return Ok(());
    };
    if !policy.enabled {
        return Ok(());
    }

    let vault = inner.storage.vault(vault_id)?;
    let remote = inner.storage.engine(vault_id)?;
    let Some(local) = inner.storage.cache_engine(vault_id)? else {
        tracing::debug!(vault_id, "vault has no remote side; nothing to sync");
        return Ok(());
    };
    let local: Arc<dyn StorageEngine> = local;

    inner.policies.report_started(vault_id, Utc::now());
    let mut event = SyncEvent::started(vault_id);
    inner.events.upsert(event.clone());
    tracing::info!(vault_id, event_id = %event.id, "sync cycle started");

    let mut replay_throughput = ThroughputSet::new();
    let outcome = async {
        // Pending FS operations replay upstream before planning; a failed
        // replay leaves its path to ordinary conflict handling.
        operations::replay(
            inner.operations.as_ref(),
            &remote,
            vault_id,
            &mut replay_throughput,
        )
        .await?;

        cancel.check()?;
        let local_listing = local.list("/", true).await?;
        let remote_listing = remote.list("/", true).await?;
        let remote_used: u64 = remote_listing
            .iter()
            .filter(|m| m.kind == EntryKind::File)
            .map(|m| m.size)
            .sum();

        let plan = planner::build(
            &to_listing(local_listing),
            &to_listing(remote_listing),
            &policy,
        );
        for conflict in &plan.conflicts {
            inner.events.record_conflict(conflict.clone());
        }

        let executor = Arc::new(PlanExecutor::new(
            vault.clone(),
            policy.clone(),
            Arc::clone(&local),
            Arc::clone(&remote),
            Arc::clone(&inner.cache),
            cancel.clone(),
            inner.executor_config.clone(),
        ));
        executor.execute(plan, remote_used).await
    }
    .await;

    match outcome {
        Ok(outcome) => {
            let mut throughput = replay_throughput;
            throughput.merge(outcome.throughput);
            let failed = outcome.failures.len();

            if failed == 0 {
                event.finish(SyncStatus::Success, None, throughput.finish());
                inner.events.upsert(event);
                inner.events.purge_old_events(vault_id);
                tracing::info!(vault_id, executed = outcome.executed, "sync cycle succeeded");
                Ok(())
            } else {
                let summary = format!(
                    "{failed} of {} actions failed",
                    failed + outcome.executed
                );
                event.finish(SyncStatus::Failed, Some(summary.clone()), throughput.finish());
                inner.events.upsert(event);
                inner.events.purge_old_events(vault_id);
                Err(Error::internal(summary))
            }
        }
        Err(err) => {
            let status = if matches!(err, Error::Cancelled) {
                SyncStatus::Cancelled
            } else {
                SyncStatus::Failed
            };
            event.finish(status, Some(err.to_string()), replay_throughput.finish());
            inner.events.upsert(event);
            inner.events.purge_old_events(vault_id);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_orders_by_due_time() {
        let mut queue = BinaryHeap::new();
        let base = Utc::now();
        queue.push(SyncTask {
            vault_id: 1,
            next_due_at: base + TimeDelta::seconds(30),
        });
        queue.push(SyncTask {
            vault_id: 2,
            next_due_at: base,
        });
        queue.push(SyncTask {
            vault_id: 3,
            next_due_at: base + TimeDelta::seconds(10),
        });

        let order: Vec<VaultId> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.vault_id)
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn backoff_doubles_and_caps_at_the_interval() {
        assert_eq!(backoff_secs(1, 300), 2);
        assert_eq!(backoff_secs(2, 300), 4);
        assert_eq!(backoff_secs(3, 300), 8);
        assert_eq!(backoff_secs(10, 300), 300);
        assert_eq!(backoff_secs(63, 300), 300);
    }
}
