//! Local disk storage engine

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::types::{normalize_rel_path, CancelFlag, EntryKind, FileMeta};
use crate::{Error, Result};

use super::{StorageEngine, StorageType};

const HASH_CHUNK: usize = 64 * 1024;

/// Filesystem-backed engine rooted at a backing directory.
pub struct LocalDiskEngine {
    root: PathBuf,
}

impl LocalDiskEngine {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a vault-relative path against the backing root. Paths are
    /// normalised first, and the resolved path must stay under the root.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let norm = normalize_rel_path(rel)?;
        let abs = self.root.join(norm.trim_start_matches('/'));
        if !abs.starts_with(&self.root) {
            return Err(Error::Unauthorized(format!(
                "path escapes backing root: {rel}"
            )));
        }
        Ok(abs)
    }

    fn rel_of(&self, abs: &Path) -> Result<String> {
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| Error::internal("listing produced a path outside the root"))?;
        let rel = rel.to_str().ok_or_else(|| {
            Error::internal(format!("non-UTF8 path in backing store: {}", abs.display()))
        })?;
        normalize_rel_path(rel)
    }

    async fn meta_for(&self, abs: &Path, with_hash: bool) -> Result<FileMeta> {
        let metadata = fs::metadata(abs).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(abs.display().to_string()),
            _ => Error::Io(e),
        })?;
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let hash = if with_hash && kind == EntryKind::File {
            Some(hash_file(abs).await?)
        } else {
            None
        };
        Ok(FileMeta {
            rel_path: self.rel_of(abs)?,
            size: if kind == EntryKind::File {
                metadata.len()
            } else {
                0
            },
            modified,
            hash,
            kind,
        })
    }
}

/// MD5 of a file's content, streamed in chunks. Matches the ETag an
/// S3-compatible store reports for single-part uploads.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of an in-memory payload, hex encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

#[async_trait]
impl StorageEngine for LocalDiskEngine {
    async fn mkdir(&self, rel: &str) -> Result<()> {
        let abs = self.resolve(rel)?;
        fs::create_dir_all(&abs).await?;
        Ok(())
    }

    async fn write(&self, rel: &str, data: Bytes, overwrite: bool) -> Result<()> {
        let abs = self.resolve(rel)?;
        if !overwrite && abs.exists() {
            return Err(Error::already_exists(rel.to_string()));
        }
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&abs, &data).await?;
        Ok(())
    }

    async fn read(&self, rel: &str) -> Result<Bytes> {
        let abs = self.resolve(rel)?;
        match fs::read(&abs).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(rel.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, rel: &str) -> Result<()> {
        let abs = self.resolve(rel)?;
        let metadata = match fs::metadata(&abs).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(rel.to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if metadata.is_dir() {
            // Non-empty directories are refused, matching rmdir.
            fs::remove_dir(&abs).await?;
        } else {
            fs::remove_file(&abs).await?;
        }
        Ok(())
    }

    async fn exists(&self, rel: &str) -> Result<bool> {
        let abs = self.resolve(rel)?;
        Ok(abs.exists())
    }

    async fn list(&self, rel: &str, recursive: bool) -> Result<Vec<FileMeta>> {
        let start = self.resolve(rel)?;
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = self.meta_for(&path, true).await?;
                let is_dir = meta.kind == EntryKind::Directory;
                results.push(meta);
                if is_dir && recursive {
                    pending.push(path);
                }
            }
        }
        results.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(results)
    }

    async fn stat(&self, rel: &str) -> Result<FileMeta> {
        let abs = self.resolve(rel)?;
        self.meta_for(&abs, true).await
    }

    fn abs(&self, rel: &str) -> Result<String> {
        let abs = self.resolve(rel)?;
        Ok(abs.to_string_lossy().into_owned())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }

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
