//! Plan execution
//!
//! Dispatches a plan's actions to bounded workers in the planner's group
//! order, accounts throughput per metric, and keeps the FS cache in step
//! with the engines so a concurrent FUSE lookup sees either the pre-state
//! or the post-state of an action, never a torn one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::fscache::FsCache;
use crate::storage::StorageEngine;
use crate::types::{CancelFlag, Entry, EntryKind, Vault};
use crate::{Error, Result};

use super::planner::{Action, Plan};
use super::policy::RemotePolicy;
use super::preflight;
use super::throughput::{Metric, ThroughputSet};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Bound on concurrently executing transfer actions.
    pub max_inflight: usize,
    /// Free-space headroom for download preflight.
    pub free_space_reserve: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_inflight: 8,
            free_space_reserve: preflight::DEFAULT_FREE_SPACE_RESERVE,
        }
    }
}

/// One action that failed. The rest of the plan keeps going unless the
/// failure was `PreflightSpace` or `Cancelled`.
#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub path: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub executed: usize,
    pub failures: Vec<ActionFailure>,
    pub throughput: ThroughputSet,
    /// Bytes freed by the cache trim pass, if one ran.
    pub trimmed_bytes: u64,
}

pub struct PlanExecutor {
    vault: Vault,
    policy: RemotePolicy,
    local: Arc<dyn StorageEngine>,
    remote: Arc<dyn StorageEngine>,
    cache: Arc<FsCache>,
    cancel: CancelFlag,
    config: ExecutorConfig,
    throughput: Mutex<ThroughputSet>,
    failures: Mutex<Vec<ActionFailure>>,
    executed: AtomicUsize,
}

impl PlanExecutor {
    pub fn new(
        vault: Vault,
        policy: RemotePolicy,
        local: Arc<dyn StorageEngine>,
        remote: Arc<dyn StorageEngine>,
        cache: Arc<FsCache>,
        cancel: CancelFlag,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            vault,
            policy,
            local,
            remote,
            cache,
            cancel,
            config,
            throughput: Mutex::new(ThroughputSet::new()),
            failures: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
        }
    }

    /// Execute a plan. `remote_used` is the byte total of the remote
    /// listing the plan was built from, consumed by quota preflight.
    pub async fn execute(self: Arc<Self>, plan: Plan, remote_used: u64) -> Result<SyncOutcome> {
        preflight::check(
            &plan,
            &self.vault,
            remote_used,
            &self.vault.backing_path,
            self.policy.encrypt_upstream,
            self.config.free_space_reserve,
        )?;

        let mut dirs = Vec::new();
        let mut uploads = Vec::new();
        let mut downloads = Vec::new();
        let mut deletes = Vec::new();
        for action in plan.actions {
            match &action {
                Action::EnsureDirectories { .. } => dirs.push(action),
                Action::Upload { .. } => uploads.push(action),
                Action::Download { .. } => downloads.push(action),
                // Planner emits remote deletes ahead of local ones.
                Action::DeleteRemote { .. } | Action::DeleteLocal { .. } => deletes.push(action),
            }
        }

        // Directory creation is cheap and order-sensitive; run it serially
        // ahead of any transfer that references the new parents.
        for action in dirs {
            self.run_recorded(action).await?;
        }
        self.run_group(uploads).await?;
        self.run_group(downloads).await?;
        for action in deletes {
            self.run_recorded(action).await?;
        }

        let trimmed_bytes = if self.policy.free_after_download() {
            self.trim_cache().await.unwrap_or_else(|err| {
                tracing::warn!(vault_id = self.vault.id, error = %err, "cache trim failed");
                0
            })
        } else {
            0
        };

        let this = Arc::try_unwrap(self).map_err(|_| {
            Error::internal("plan executor still referenced after execution")
        })?;
        Ok(SyncOutcome {
            executed: this.executed.load(Ordering::SeqCst),
            failures: this.failures.into_inner(),
            throughput: this.throughput.into_inner(),
            trimmed_bytes,
        })
    }

    /// Run one group with bounded concurrency. Only cancellation aborts;
    /// per-action failures are recorded and the group continues.
    async fn run_group(self: &Arc<Self>, actions: Vec<Action>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight.max(1)));
        let mut handles = Vec::with_capacity(actions.len());

        for action in actions {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(Error::Cancelled);
                };
                this.run_recorded(action).await
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    return Err(Error::internal(format!("sync worker panicked: {join_err}")))
                }
            }
        }
        Ok(())
    }

    /// Run one action, folding failures into the outcome. `Cancelled`
    /// propagates and aborts the plan.
    async fn run_recorded(&self, action: Action) -> Result<()> {
        let path = action.key().to_string();
        match self.run_action(action).await {
            Ok(()) => {
                self.executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                tracing::warn!(
                    vault_id = self.vault.id,
                    path = %path,
                    error = %err,
                    "sync action failed"
                );
                self.failures.lock().push(ActionFailure {
                    path,
                    kind: err.kind(),
                    message: err.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn run_action(&self, action: Action) -> Result<()> {
        self.cancel.check()?;
        match action {
            Action::EnsureDirectories { dirs } => {
                for dir in dirs {
                    self.local.mkdir(&dir).await?;
                    self.remote.mkdir(&dir).await?;
                }
                Ok(())
            }
            Action::Upload { key, local: meta } => {
                let data = self.local.read(&key).await?;
                let size = data.len() as u64;
                self.remote
                    .write_cancellable(&key, data, true, &self.cancel)
                    .await?;

                let mut entry = Entry::from_meta(self.vault.id, &meta);
                // Prefer the server-observed modification time.
                if let Ok(remote_meta) = self.remote.stat(&key).await {
                    entry.modified_at = remote_meta.modified;
                }
                entry.cache_path = Some(PathBuf::from(self.local.abs(&key)?));
                self.cache.cache(entry);

                self.throughput.lock().record(Metric::Upload, size);
                Ok(())
            }
            Action::Download {
                key,
                remote: meta,
                free_after_download,
            } => {
                let data = self.remote.read(&key).await?;
                let size = data.len() as u64;
                self.local.write(&key, data, true).await?;

                let mut entry = Entry::from_meta(self.vault.id, &meta);
                entry.cache_path = Some(PathBuf::from(self.local.abs(&key)?));
                let inode = self.cache.cache(entry);

                if free_after_download && self.cache.handle_count(inode) > 0 {
                    // The materialised bytes go away once the reader that
                    // asked for them closes its handle.
                    self.cache.free_backing_after_use(inode);
                }

                self.throughput.lock().record(Metric::Download, size);
                Ok(())
            }
            Action::DeleteRemote { key, remote: meta } => {
                self.remote.delete(&key).await?;
                self.throughput.lock().record(Metric::Delete, meta.size);
                Ok(())
            }
            Action::DeleteLocal { key, local: meta } => {
                // Evict first so no lookup resolves a path whose bytes are
                // about to disappear; eviction defers behind open handles.
                self.cache.evict_by_path(self.vault.id, &key);
                self.local.delete(&key).await?;
                self.throughput.lock().record(Metric::Delete, meta.size);
                Ok(())
            }
        }
    }

    /// Trim the materialised view down to the vault quota, oldest modified
    /// first. Entries with open handles survive; identity mappings stay so
    /// a later access re-downloads.
    async fn trim_cache(&self) -> Result<u64> {
        if self.vault.quota == 0 {
            return Ok(0);
        }
        let listing = self.local.list("/", true).await?;
        let mut files: Vec<_> = listing
            .into_iter()
            .filter(|m| m.kind == EntryKind::File)
            .collect();
        let total: u64 = files.iter().map(|m| m.size).sum();
        if total <= self.vault.quota {
            return Ok(0);
        }

        files.sort_by_key(|m| m.modified);
        let mut freed = 0u64;
        for meta in files {
            if total - freed <= self.vault.quota {
                break;
            }
            if let Some(inode) = self.cache.resolve_inode(self.vault.id, &meta.rel_path) {
                if self.cache.handle_count(inode) > 0 {
                    continue;
                }
            }
            if let Err(err) = self.local.delete(&meta.rel_path).await {
                tracing::debug!(path = %meta.rel_path, error = %err, "trim skipped a file");
                continue;
            }
            freed += meta.size;
        }
        tracing::debug!(vault_id = self.vault.id, freed, "trimmed materialised cache");
        Ok(freed)
    }
}
