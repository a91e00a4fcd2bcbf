//! Daemon configuration loaded from file + environment.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sync::policy::{ConflictPolicy, RemotePolicy, Strategy};
use crate::types::{Vault, VaultId, VaultType};

const DEFAULT_SEALED_BLOB_PATH: &str = "/var/lib/vaulthalla/sealed_master.blob";
const DEFAULT_FREE_SPACE_RESERVE: u64 = 64 * 1024 * 1024; // 64 MiB
const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024; // 5 MiB

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub daemon: DaemonSection,
    pub database: DatabaseSection,
    pub sync: SyncSection,
    pub vaults: Vec<VaultSection>,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("VAULTHALLA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VAULTHALLA")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        for vault in &config.vaults {
            vault.validate()?;
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Root under which vault mount points live.
    pub mount_root: PathBuf,
    /// Sealed master key blob location.
    pub sealed_master_key_path: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/vaulthalla"),
            sealed_master_key_path: PathBuf::from(DEFAULT_SEALED_BLOB_PATH),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseSection {
    pub connection_str: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

impl DatabaseSection {
    /// Resolve the connection string: `VAULTHALLA_DB_CONNECTION_STR` wins,
    /// then the discrete `DB_*` variables, then the config file values.
    pub fn connection_string(&self) -> Result<String> {
        if let Ok(conn) = env::var("VAULTHALLA_DB_CONNECTION_STR") {
            return Ok(conn);
        }
        if let Some(conn) = &self.connection_str {
            return Ok(conn.clone());
        }

        let host = env::var("DB_HOST")
            .ok()
            .or_else(|| self.host.clone())
            .context("database host not configured")?;
        let port = env::var("DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or(self.port)
            .unwrap_or(5432);
        let user = env::var("DB_USER")
            .ok()
            .or_else(|| self.user.clone())
            .context("database user not configured")?;
        let password = env::var("DB_PASSWORD")
            .ok()
            .or_else(|| self.password.clone())
            .unwrap_or_default();
        let name = env::var("DB_NAME")
            .ok()
            .or_else(|| self.name.clone())
            .context("database name not configured")?;

        Ok(format!(
            "host={host} port={port} user={user} password={password} dbname={name}"
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Sync worker bound; 0 means 2x the CPU core count.
    pub sync_workers: usize,
    /// Bound on in-flight S3 transfers.
    pub max_inflight_transfers: usize,
    pub connect_timeout_secs: u64,
    pub body_timeout_secs: u64,
    /// Free-space headroom kept aside during download preflight.
    pub free_space_reserve_bytes: u64,
    /// Multipart threshold and part size.
    pub part_size_bytes: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            sync_workers: 0,
            max_inflight_transfers: 8,
            connect_timeout_secs: 30,
            body_timeout_secs: 300,
            free_space_reserve_bytes: DEFAULT_FREE_SPACE_RESERVE,
            part_size_bytes: DEFAULT_PART_SIZE,
        }
    }
}

impl SyncSection {
    pub fn effective_sync_workers(&self) -> usize {
        if self.sync_workers > 0 {
            self.sync_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One vault declaration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VaultSection {
    pub id: VaultId,
    pub name: String,
    pub owner_id: u32,
    pub quota_bytes: u64,
    #[serde(rename = "type")]
    pub vault_type: Option<VaultType>,
    pub mount_point: Option<PathBuf>,
    pub backing_path: Option<PathBuf>,
    pub s3: Option<S3Section>,
    pub policy: Option<PolicySection>,
}

impl VaultSection {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("vault {} has no name", self.id);
        }
        let vault_type = self.vault_type.context("vault type must be specified")?;
        if self.backing_path.is_none() {
            bail!("vault '{}' has no backing_path", self.name);
        }
        match vault_type {
            VaultType::S3 => {
                let s3 = self
                    .s3
                    .as_ref()
                    .with_context(|| format!("vault '{}' is s3 but has no [vaults.s3]", self.name))?;
                if s3.bucket.trim().is_empty() {
                    bail!("vault '{}': s3.bucket must be specified", self.name);
                }
                if s3.region.trim().is_empty() {
                    bail!("vault '{}': s3.region must be specified", self.name);
                }
            }
            VaultType::Local => {
                if self.policy.is_some() {
                    bail!(
                        "vault '{}' is local and cannot carry a remote-sync policy",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }

    /// Materialise the vault model. `validate` must have passed.
    pub fn to_vault(&self, mount_root: &Path) -> Vault {
        Vault {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name.clone(),
            quota: self.quota_bytes,
            vault_type: self.vault_type.unwrap_or(VaultType::Local),
            mount_point: self
                .mount_point
                .clone()
                .unwrap_or_else(|| mount_root.join(&self.name)),
            backing_path: self.backing_path.clone().unwrap_or_default(),
            is_active: true,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn to_policy(&self) -> Option<RemotePolicy> {
        let section = self.policy.as_ref()?;
        let mut policy = RemotePolicy {
            id: 0,
            vault_id: self.id,
            interval_secs: section.interval_secs,
            enabled: section.enabled,
            last_sync_at: None,
            last_success_at: None,
            strategy: section.strategy,
            conflict_policy: section.conflict_policy,
            encrypt_upstream: section.encrypt_upstream,
            config_hash: String::new(),
        };
        policy.rehash_config();
        Some(policy)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3Section {
    /// Endpoint URL, e.g. `https://s3.us-east-1.amazonaws.com`.
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub interval_secs: u64,
    pub enabled: bool,
    pub strategy: Strategy,
    pub conflict_policy: ConflictPolicy,
    pub encrypt_upstream: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            enabled: true,
            strategy: Strategy::Sync,
            conflict_policy: ConflictPolicy::KeepNewest,
            encrypt_upstream: false,
        }
    }
}
