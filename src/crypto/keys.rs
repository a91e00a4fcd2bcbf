//! Per-vault data keys wrapped under the master key.
//!
//! Data keys live in memory only; what a store would persist is the wrapped
//! form plus its IV. Rotation mints a new version while the previous one
//! stays resident until all ciphertext has been re-wrapped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::master::MasterKeyProvider;
use crate::crypto::{self, IV_SIZE, KEY_SIZE};
use crate::types::VaultId;
use crate::{Error, Result};

/// One version of a vault's data key.
#[derive(Clone)]
pub struct VaultKey {
    pub vault_id: VaultId,
    pub version: u32,
    data_key: Arc<Zeroizing<[u8; KEY_SIZE]>>,
    /// Data key encrypted under the master key.
    pub wrapped_key: Vec<u8>,
    /// IV the wrap was performed with.
    pub wrap_iv: [u8; IV_SIZE],
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VaultKey {
    pub fn data_key(&self) -> &[u8; KEY_SIZE] {
        &self.data_key
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never appears in logs, wrapped or not.
        f.debug_struct("VaultKey")
            .field("vault_id", &self.vault_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

struct VaultKeyState {
    current: VaultKey,
    /// Previous version, retained while a rotation is in progress.
    rotating_from: Option<VaultKey>,
}

/// Loads and caches unwrapped vault keys; keys load on first use.
pub struct VaultKeyManager {
    master: Arc<MasterKeyProvider>,
    keys: Mutex<HashMap<VaultId, VaultKeyState>>,
}

impl VaultKeyManager {
    pub fn new(master: Arc<MasterKeyProvider>) -> Self {
        Self {
            master,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Current key for a vault, minting version 1 on first use.
    pub fn current_key(&self, vault_id: VaultId) -> Result<VaultKey> {
        let mut keys = self.keys.lock();
        if let Some(state) = keys.get(&vault_id) {
            return Ok(state.current.clone());
        }
        let key = self.mint(vault_id, 1)?;
        keys.insert(
            vault_id,
            VaultKeyState {
                current: key.clone(),
                rotating_from: None,
            },
        );
        Ok(key)
    }

    /// Key by explicit version, used when decrypting objects whose metadata
    /// names an older version during rotation.
    pub fn key_by_version(&self, vault_id: VaultId, version: u32) -> Result<VaultKey> {
        let keys = self.keys.lock();
        let state = keys
            .get(&vault_id)
            .ok_or_else(|| Error::not_found(format!("no key loaded for vault {vault_id}")))?;
        if state.current.version == version {
            return Ok(state.current.clone());
        }
        if let Some(old) = &state.rotating_from {
            if old.version == version {
                return Ok(old.clone());
            }
        }
        Err(Error::not_found(format!(
            "vault {vault_id} has no key version {version}"
        )))
    }

    /// Start a rotation: a new version becomes current, the old one stays
    /// available for decryption until `finish_rotation`.
    pub fn begin_rotation(&self, vault_id: VaultId) -> Result<u32> {
        let mut keys = self.keys.lock();
        let state = keys
            .get_mut(&vault_id)
            .ok_or_else(|| Error::not_found(format!("no key loaded for vault {vault_id}")))?;
        if state.rotating_from.is_some() {
            return Err(Error::policy(format!(
                "vault {vault_id} already has a rotation in progress"
            )));
        }
        let next_version = state.current.version + 1;
        let next = self.mint(vault_id, next_version)?;
        state.rotating_from = Some(std::mem::replace(&mut state.current, next));
        tracing::info!(vault_id, version = next_version, "vault key rotation started");
        Ok(next_version)
    }

    /// Complete a rotation, dropping the superseded key version.
    pub fn finish_rotation(&self, vault_id: VaultId) -> Result<()> {
        let mut keys = self.keys.lock();
        let state = keys
            .get_mut(&vault_id)
            .ok_or_else(|| Error::not_found(format!("no key loaded for vault {vault_id}")))?;
        if state.rotating_from.take().is_none() {
            return Err(Error::policy(format!(
                "vault {vault_id} has no rotation in progress"
            )));
        }
        tracing::info!(vault_id, version = state.current.version, "vault key rotation finished");
        Ok(())
    }

    pub fn rotation_in_progress(&self, vault_id: VaultId) -> bool {
        self.keys
            .lock()
            .get(&vault_id)
            .map(|s| s.rotating_from.is_some())
            .unwrap_or(false)
    }

    /// Unwrap a persisted key back into memory.
    pub fn load_wrapped(
        &self,
        vault_id: VaultId,
        version: u32,
        wrapped_key: &[u8],
        wrap_iv: &[u8],
    ) -> Result<VaultKey> {
        let plain = crypto::decrypt(wrapped_key, self.master.master_key(), wrap_iv)?;
        if plain.len() != KEY_SIZE {
            return Err(Error::corruption(format!(
                "unwrapped vault key has {} bytes",
                plain.len()
            )));
        }
        let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
        data_key.copy_from_slice(&plain);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(wrap_iv);

        let key = VaultKey {
            vault_id,
            version,
            data_key: Arc::new(data_key),
            wrapped_key: wrapped_key.to_vec(),
            wrap_iv: iv,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.keys.lock().insert(
            vault_id,
            VaultKeyState {
                current: key.clone(),
                rotating_from: None,
            },
        );
        Ok(key)
    }

    fn mint(&self, vault_id: VaultId, version: u32) -> Result<VaultKey> {
        let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut data_key[..]);

        let (wrapped_key, wrap_iv) = crypto::encrypt(&data_key[..], self.master.master_key())?;

        Ok(VaultKey {
            vault_id,
            version,
            data_key: Arc::new(data_key),
            wrapped_key,
            wrap_iv,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, VaultKeyManager) {
        let dir = TempDir::new().unwrap();
        let master = MasterKeyProvider::init(dir.path().join("master.blob")).unwrap();
        (dir, VaultKeyManager::new(Arc::new(master)))
    }

    #[test]
    fn first_use_mints_version_one() {
        let (_dir, manager) = manager();
        let key = manager.current_key(7).unwrap();
        assert_eq!(key.version, 1);
        // Stable across lookups.
        assert_eq!(manager.current_key(7).unwrap().data_key(), key.data_key());
    }

    #[test]
    fn wrap_round_trips_through_the_master_key() {
        let (_dir, manager) = manager();
        let key = manager.current_key(1).unwrap();
        let reloaded = manager
            .load_wrapped(1, key.version, &key.wrapped_key, &key.wrap_iv)
            .unwrap();
        assert_eq!(reloaded.data_key(), key.data_key());
    }

    #[test]
    fn rotation_keeps_the_old_version_until_finished() {
        let (_dir, manager) = manager();
        let v1 = manager.current_key(3).unwrap();
        let v2 = manager.begin_rotation(3).unwrap();
        assert_eq!(v2, 2);
        assert!(manager.rotation_in_progress(3));

        // Both versions resolve while the rotation is open.
        assert_eq!(manager.key_by_version(3, 1).unwrap().data_key(), v1.data_key());
        assert_eq!(manager.current_key(3).unwrap().version, 2);

        // A second rotation cannot start meanwhile.
        assert!(manager.begin_rotation(3).is_err());

        manager.finish_rotation(3).unwrap();
        assert!(!manager.rotation_in_progress(3));
        assert!(manager.key_by_version(3, 1).is_err());
    }
}
