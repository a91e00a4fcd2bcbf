//! Sealed master key provider.
//!
//! A sealed blob at a fixed path holds the 256-bit master key. The first
//! start generates and seals it; subsequent starts unseal it. The seal
//! syscall surface belongs to the platform layer that owns the blob path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::KEY_SIZE;
use crate::{Error, Result};

#[derive(Debug)]
pub struct MasterKeyProvider {
    blob_path: PathBuf,
    master_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKeyProvider {
    /// Unseal the blob if it exists, otherwise generate and seal a fresh key.
    pub fn init(blob_path: impl Into<PathBuf>) -> Result<Self> {
        let blob_path = blob_path.into();
        if blob_path.exists() {
            Self::unseal(blob_path)
        } else {
            Self::generate_and_seal(blob_path)
        }
    }

    pub fn master_key(&self) -> &[u8; KEY_SIZE] {
        &self.master_key
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    fn generate_and_seal(blob_path: PathBuf) -> Result<Self> {
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut master_key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut master_key[..]);

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&blob_path)?;
        file.write_all(master_key.as_ref())?;
        file.sync_all()?;

        tracing::info!("Sealed new master key at {}", blob_path.display());
        Ok(Self {
            blob_path,
            master_key,
        })
    }

    fn unseal(blob_path: PathBuf) -> Result<Self> {
        let raw = Zeroizing::new(fs::read(&blob_path)?);
        if raw.len() != KEY_SIZE {
            return Err(Error::corruption(format!(
                "sealed master key blob has {} bytes, expected {KEY_SIZE}",
                raw.len()
            )));
        }
        let mut master_key = Zeroizing::new([0u8; KEY_SIZE]);
        master_key.copy_from_slice(&raw[..]);

        tracing::debug!("Unsealed master key from {}", blob_path.display());
        Ok(Self {
            blob_path,
            master_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_init_seals_then_unseals_the_same_key() {
        let dir = TempDir::new().unwrap();
        let blob = dir.path().join("sealed_master.blob");

        let first = MasterKeyProvider::init(&blob).unwrap();
        let second = MasterKeyProvider::init(&blob).unwrap();
        assert_eq!(first.master_key(), second.master_key());
    }

    #[test]
    fn truncated_blob_is_corruption() {
        let dir = TempDir::new().unwrap();
        let blob = dir.path().join("sealed_master.blob");
        fs::write(&blob, b"short").unwrap();

        let err = MasterKeyProvider::init(&blob).unwrap_err();
        assert_eq!(err.kind(), "corruption");
    }
}
