//! S3-compatible storage engine
//!
//! Implements the engine contract over a SigV4-signed HTTP client. When the
//! vault's policy demands upstream encryption, payloads are wrapped with the
//! vault data key and the IV and key version travel as object metadata.
//! Objects lacking that metadata are treated as plaintext.

pub mod client;
pub mod sign;
pub mod xml;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::crypto::{self, keys::VaultKeyManager};
use crate::types::{normalize_rel_path, CancelFlag, EntryKind, FileMeta, VaultId};
use crate::{Error, Result};

use super::{StorageEngine, StorageType};

pub use client::{ObjectInfo, S3Client, S3Config};

const META_IV: &str = "iv";
const META_KEY_VERSION: &str = "keyver";

pub struct S3Engine {
    client: S3Client,
    vault_id: VaultId,
    /// Present when the vault encrypts payloads before they leave the host.
    keys: Option<Arc<VaultKeyManager>>,
}

impl S3Engine {
    pub fn new(client: S3Client, vault_id: VaultId) -> Self {
        Self {
            client,
            vault_id,
            keys: None,
        }
    }

    /// Enable upstream encryption with the vault's data keys.
    pub fn with_encryption(mut self, keys: Arc<VaultKeyManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    fn key_of(rel: &str) -> Result<String> {
        let norm = normalize_rel_path(rel)?;
        Ok(norm.trim_start_matches('/').to_string())
    }

    /// Wrap a payload for upload. Returns the ciphertext and the metadata
    /// that has to travel with the object.
    fn seal_payload(&self, data: Bytes) -> Result<(Bytes, BTreeMap<String, String>)> {
        let Some(keys) = &self.keys else {
            return Ok((data, BTreeMap::new()));
        };
        let key = keys.current_key(self.vault_id)?;
        let (ciphertext, iv) = crypto::encrypt(&data, key.data_key())?;

        let mut metadata = BTreeMap::new();
        metadata.insert(META_IV.to_string(), BASE64.encode(iv));
        metadata.insert(META_KEY_VERSION.to_string(), key.version.to_string());
        Ok((Bytes::from(ciphertext), metadata))
    }

    /// Unwrap a downloaded payload when its metadata marks it encrypted.
    fn open_payload(&self, data: Bytes, info: &ObjectInfo) -> Result<Bytes> {
        let Some(iv_b64) = info.metadata.get(META_IV) else {
            return Ok(data);
        };
        let keys = self.keys.as_ref().ok_or_else(|| {
            Error::policy(format!(
                "vault {} received an encrypted object but has no key manager",
                self.vault_id
            ))
        })?;
        let version: u32 = info
            .metadata
            .get(META_KEY_VERSION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let iv = BASE64
            .decode(iv_b64)
            .map_err(|_| Error::corruption("undecodable IV metadata"))?;
        let key = keys.key_by_version(self.vault_id, version)?;
        let plain = crypto::decrypt(&data, key.data_key(), &iv)?;
        Ok(Bytes::from(plain))
    }

    async fn write_inner(
        &self,
        rel: &str,
        data: Bytes,
        overwrite: bool,
        cancel: Option<&CancelFlag>,
    ) -> Result<()> {
        let key = Self::key_of(rel)?;
        if !overwrite && self.client.head_object(&key).await?.is_some() {
            return Err(Error::already_exists(rel.to_string()));
        }

        let (payload, metadata) = self.seal_payload(data)?;
        let etag = if payload.len() as u64 > self.client.part_size() {
            self.client
                .upload_multipart(&key, payload, &metadata, cancel)
                .await?
        } else {
            if let Some(flag) = cancel {
                flag.check()?;
            }
            self.client.put_object(&key, payload, &metadata).await?
        };

        tracing::debug!(vault_id = self.vault_id, rel, %etag, "uploaded object");
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for S3Engine {
    /// Directories are implicit in object keys; creating one is a no-op.
    async fn mkdir(&self, rel: &str) -> Result<()> {
        normalize_rel_path(rel)?;
        Ok(())
    }

    async fn write(&self, rel: &str, data: Bytes, overwrite: bool) -> Result<()> {
        self.write_inner(rel, data, overwrite, None).await
    }

    async fn read(&self, rel: &str) -> Result<Bytes> {
        let key = Self::key_of(rel)?;
        let (data, info) = self.client.get_object(&key).await?;
        self.open_payload(data, &info)
    }

    async fn delete(&self, rel: &str) -> Result<()> {
        let key = Self::key_of(rel)?;
        self.client.delete_object(&key).await
    }

    async fn exists(&self, rel: &str) -> Result<bool> {
        let key = Self::key_of(rel)?;
        Ok(self.client.head_object(&key).await?.is_some())
    }

    async fn list(&self, rel: &str, recursive: bool) -> Result<Vec<FileMeta>> {
        let norm = normalize_rel_path(rel)?;
        let prefix = if norm == "/" {
            String::new()
        } else {
            format!("{}/", norm.trim_start_matches('/'))
        };

        let objects = self.client.list_all(&prefix).await?;
        // Children of the listed directory start past its trailing slash.
        let base_len = if norm == "/" { 1 } else { norm.len() + 1 };
        let mut out = Vec::with_capacity(objects.len());
        let mut seen_dirs = std::collections::BTreeSet::new();

        for obj in objects {
            let rel_path = normalize_rel_path(&obj.key)?;
            if rel_path.len() < base_len {
                continue;
            }
            let tail = &rel_path[base_len..];
            let depth_ok = recursive || !tail.contains('/');

            if obj.key.ends_with('/') {
                // Zero-byte directory marker.
                if depth_ok {
                    seen_dirs.insert(rel_path.clone());
                    out.push(FileMeta {
                        rel_path,
                        size: 0,
                        modified: obj.last_modified,
                        hash: None,
                        kind: EntryKind::Directory,
                    });
                }
                continue;
            }

            if !depth_ok {
                // Surface the immediate sub-prefix as a directory.
                if let Some(slash) = tail.find('/') {
                    let dir = format!("{}{}", &rel_path[..base_len], &tail[..slash]);
                    if seen_dirs.insert(dir.clone()) {
                        out.push(FileMeta {
                            rel_path: dir,
                            size: 0,
                            modified: obj.last_modified,
                            hash: None,
                            kind: EntryKind::Directory,
                        });
                    }
                }
                continue;
            }

            out.push(FileMeta {
                rel_path,
                size: obj.size,
                modified: obj.last_modified,
                hash: Some(obj.etag),
                kind: EntryKind::File,
            });
        }

        out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(out)
    }

    async fn stat(&self, rel: &str) -> Result<FileMeta> {
        let key = Self::key_of(rel)?;
        let info = self
            .client
            .head_object(&key)
            .await?
            .ok_or_else(|| Error::not_found(rel.to_string()))?;
        Ok(FileMeta {
            rel_path: normalize_rel_path(rel)?,
            size: info.size,
            modified: info.last_modified.unwrap_or_else(chrono::Utc::now),
            hash: Some(info.etag),
            kind: EntryKind::File,
        })
    }

    /// The logical object key, qualified by bucket.
    fn abs(&self, rel: &str) -> Result<String> {
        let key = Self::key_of(rel)?;
        Ok(format!("{}/{}", self.client.bucket(), key))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Cloud
    }

    async fn write_cancellable(
        &self,
        rel: &str,
        data: Bytes,
        overwrite: bool,
        cancel: &CancelFlag,
    ) -> Result<()> {
        self.write_inner(rel, data, overwrite, Some(cancel)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_drop_the_leading_slash() {
        assert_eq!(S3Engine::key_of("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(S3Engine::key_of("a/b.txt").unwrap(), "a/b.txt");
        assert!(S3Engine::key_of("/a/../../b").is_err());
    }
}
