//! Vaulthalla daemon binary

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vaulthalla::config::AppConfig;
use vaulthalla::crypto::keys::VaultKeyManager;
use vaulthalla::crypto::master::MasterKeyProvider;
use vaulthalla::fscache::FsCache;
use vaulthalla::storage::s3::{S3Client, S3Config, S3Engine};
use vaulthalla::storage::{LocalDiskEngine, StorageManager};
use vaulthalla::store::MemoryStore;
use vaulthalla::sync::{ExecutorConfig, SyncController};
use vaulthalla::types::VaultType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vaulthalla={}", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("vaulthalla starting");

    let master = Arc::new(MasterKeyProvider::init(
        &config.daemon.sealed_master_key_path,
    )?);
    let keys = Arc::new(VaultKeyManager::new(master));

    let storage = Arc::new(StorageManager::new());
    let cache = Arc::new(FsCache::new());
    let store = Arc::new(MemoryStore::new());
    let policy_store: Arc<dyn vaulthalla::store::PolicyStore> = store.clone();

    for section in &config.vaults {
        let vault = section.to_vault(&config.daemon.mount_root);
        let vault_id = vault.id;

        match vault.vault_type {
            VaultType::Local => {
                let engine = Arc::new(LocalDiskEngine::new(&vault.backing_path)?);
                storage.register_local(vault, engine);
            }
            VaultType::S3 => {
                let s3 = section
                    .s3
                    .as_ref()
                    .context("s3 vault is missing its [vaults.s3] section")?;
                let mut s3_config = S3Config::new(
                    s3.endpoint.as_str(),
                    s3.region.as_str(),
                    s3.bucket.as_str(),
                    s3.access_key.as_str(),
                    s3.secret_key.as_str(),
                );
                s3_config.part_size = config.sync.part_size_bytes;
                s3_config.connect_timeout =
                    std::time::Duration::from_secs(config.sync.connect_timeout_secs);
                s3_config.body_timeout =
                    std::time::Duration::from_secs(config.sync.body_timeout_secs);

                let client = S3Client::new(s3_config)?;
                let mut engine = S3Engine::new(client, vault_id);
                let encrypts = section
                    .policy
                    .as_ref()
                    .map(|p| p.encrypt_upstream)
                    .unwrap_or(false);
                if encrypts {
                    engine = engine.with_encryption(Arc::clone(&keys));
                }

                let local_view = Arc::new(LocalDiskEngine::new(&vault.backing_path)?);
                storage.register_s3(vault, Arc::new(engine), local_view);

                if let Some(policy) = section.to_policy() {
                    policy_store.upsert(policy);
                }
            }
        }

        storage.scan_into_cache(vault_id, &cache).await?;
    }

    let controller = SyncController::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        store.clone(),
        store.clone(),
        store.clone(),
        config.sync.effective_sync_workers(),
        ExecutorConfig {
            max_inflight: config.sync.max_inflight_transfers,
            free_space_reserve: config.sync.free_space_reserve_bytes,
        },
    );
    let controller_handle = controller.start();

    tracing::info!(
        vaults = storage.vaults().len(),
        "vaulthalla running; press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    controller.stop();
    let _ = controller_handle.await;

    Ok(())
}
