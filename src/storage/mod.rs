//! Storage abstraction layer
//!
//! A uniform engine contract over a vault's root, consumed by sync, FUSE
//! and command handlers, with local-disk and S3-compatible implementations.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::fscache::FsCache;
use crate::types::{CancelFlag, FileMeta, Vault, VaultId};
use crate::{Error, Result};

pub mod local;
pub mod s3;

pub use local::LocalDiskEngine;
pub use s3::S3Engine;

/// Where an engine keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Local,
    Cloud,
}

/// Uniform contract over a vault's root. All paths are vault-relative and
/// lexically normalised; `..` components are rejected.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Create a directory and all missing ancestors. Idempotent.
    async fn mkdir(&self, rel: &str) -> Result<()>;

    /// Write a file, creating parents as needed. Fails with `AlreadyExists`
    /// when `overwrite` is false and the entry exists.
    async fn write(&self, rel: &str, data: Bytes, overwrite: bool) -> Result<()>;

    async fn read(&self, rel: &str) -> Result<Bytes>;

    async fn delete(&self, rel: &str) -> Result<()>;

    async fn exists(&self, rel: &str) -> Result<bool>;

    /// List entries under a directory.
    async fn list(&self, rel: &str, recursive: bool) -> Result<Vec<FileMeta>>;

    async fn stat(&self, rel: &str) -> Result<FileMeta>;

    /// Absolute backing path (local) or logical object key (cloud).
    fn abs(&self, rel: &str) -> Result<String>;

    fn storage_type(&self) -> StorageType;

    /// Write with a cooperative cancellation flag checked at transfer
    /// boundaries. Engines with multi-request transfers override this.
    async fn write_cancellable(
        &self,
        rel: &str,
        data: Bytes,
        overwrite: bool,
        cancel: &CancelFlag,
    ) -> Result<()> {
        cancel.check()?;
        self.write(rel, data, overwrite).await
    }
}

struct MountedVault {
    vault: Vault,
    /// Primary engine: local disk, or the S3 endpoint for cloud vaults.
    engine: Arc<dyn StorageEngine>,
    /// Local materialised view of an S3 vault, rooted at its backing path.
    cache_engine: Option<Arc<LocalDiskEngine>>,
}

/// Shared engine registry keyed by vault id. Reads resolve to a cheap
/// cloned handle; mutation goes through the map's own locking.
#[derive(Default)]
pub struct StorageManager {
    mounts: DashMap<VaultId, MountedVault>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local vault.
    pub fn register_local(&self, vault: Vault, engine: Arc<LocalDiskEngine>) {
        tracing::info!(vault_id = vault.id, name = %vault.name, "mounting local vault");
        self.mounts.insert(
            vault.id,
            MountedVault {
                vault,
                engine,
                cache_engine: None,
            },
        );
    }

    /// Register a remote-backed vault together with its local cache view.
    pub fn register_s3(
        &self,
        vault: Vault,
        engine: Arc<dyn StorageEngine>,
        cache: Arc<LocalDiskEngine>,
    ) {
        tracing::info!(vault_id = vault.id, name = %vault.name, "mounting s3 vault");
        self.mounts.insert(
            vault.id,
            MountedVault {
                vault,
                engine,
                cache_engine: Some(cache),
            },
        );
    }

    /// Drop a vault from the registry. Policy/key/entry cascade is the
    /// caller's business; the engines just disappear from the map.
    pub fn remove_vault(&self, vault_id: VaultId) -> Result<()> {
        self.mounts
            .remove(&vault_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("vault {vault_id}")))
    }

    pub fn vault(&self, vault_id: VaultId) -> Result<Vault> {
        self.mounts
            .get(&vault_id)
            .map(|m| m.vault.clone())
            .ok_or_else(|| Error::not_found(format!("vault {vault_id}")))
    }

    pub fn vaults(&self) -> Vec<Vault> {
        self.mounts.iter().map(|m| m.vault.clone()).collect()
    }

    pub fn engine(&self, vault_id: VaultId) -> Result<Arc<dyn StorageEngine>> {
        self.mounts
            .get(&vault_id)
            .map(|m| Arc::clone(&m.engine))
            .ok_or_else(|| Error::not_found(format!("vault {vault_id}")))
    }

    /// Local materialised view of an S3 vault; `None` for local vaults.
    pub fn cache_engine(&self, vault_id: VaultId) -> Result<Option<Arc<LocalDiskEngine>>> {
        self.mounts
            .get(&vault_id)
            .map(|m| m.cache_engine.clone())
            .ok_or_else(|| Error::not_found(format!("vault {vault_id}")))
    }

    /// Mount-time scan: seed the FS cache from the materialised view so
    /// FUSE lookups are warm before the first sync cycle.
    pub async fn scan_into_cache(&self, vault_id: VaultId, cache: &FsCache) -> Result<usize> {
        let (vault, engine) = {
            let mount = self
                .mounts
                .get(&vault_id)
                .ok_or_else(|| Error::not_found(format!("vault {vault_id}")))?;
            let engine: Arc<dyn StorageEngine> = match &mount.cache_engine {
                Some(local) => local.clone(),
                None => Arc::clone(&mount.engine),
            };
            (mount.vault.clone(), engine)
        };

        let listing = engine.list("/", true).await?;
        let count = listing.len();
        for meta in listing {
            let mut entry = crate::types::Entry::from_meta(vault.id, &meta);
            entry.cache_path = Some(engine.abs(&meta.rel_path)?.into());
            cache.cache(entry);
        }
        tracing::debug!(vault_id, entries = count, "seeded fs cache from backing scan");
        Ok(count)
    }
}
