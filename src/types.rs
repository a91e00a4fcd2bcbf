//! Core data model for vaulthalla

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub type VaultId = u32;
pub type EntryId = u64;
pub type UserId = u32;
pub type Inode = u64;

/// Kind of filesystem object inside a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A filesystem object visible inside a vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    /// Opaque external handle; doubles as a stable S3-side identifier.
    pub alias: String,
    pub vault_id: VaultId,
    pub parent_id: Option<EntryId>,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub owner_id: UserId,
    pub group_id: u32,
    pub mode: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Set once the content has been materialised locally or remotely.
    pub content_hash: Option<String>,
    pub mime_type: String,
    /// Assigned when the entry is first observed through FUSE.
    pub inode: Option<Inode>,
    /// Vault-relative path, "/" for the root.
    pub path: String,
    /// Local materialisation of an S3-origin entry.
    pub cache_path: Option<PathBuf>,
}

impl Entry {
    /// Build an entry from a listing record. The id is assigned by the FS
    /// cache when the entry is first cached.
    pub fn from_meta(vault_id: VaultId, meta: &FileMeta) -> Self {
        let name = file_name(&meta.rel_path);
        Entry {
            id: 0,
            alias: new_alias(),
            vault_id,
            parent_id: None,
            name: name.to_string(),
            kind: meta.kind,
            size: meta.size,
            owner_id: 0,
            group_id: 0,
            mode: match meta.kind {
                EntryKind::File => 0o644,
                EntryKind::Directory => 0o755,
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            modified_at: meta.modified,
            content_hash: meta.hash.clone(),
            mime_type: match meta.kind {
                EntryKind::File => infer_mime_type(&meta.rel_path).to_string(),
                EntryKind::Directory => "inode/directory".to_string(),
            },
            inode: None,
            path: meta.rel_path.clone(),
            cache_path: None,
        }
    }
}

/// One listing record produced by a storage engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Normalised vault-relative path with a leading slash.
    pub rel_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Content equality token. MD5 hex locally, ETag remotely.
    pub hash: Option<String>,
    pub kind: EntryKind,
}

/// Backing store flavour of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultType {
    Local,
    S3,
}

/// A user-scoped filesystem namespace backed by exactly one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub owner_id: UserId,
    pub name: String,
    /// Quota in bytes; 0 means unlimited.
    pub quota: u64,
    pub vault_type: VaultType,
    /// FUSE-visible mount path.
    pub mount_point: PathBuf,
    /// Storage root for local vaults, local cache root for S3 vaults.
    pub backing_path: PathBuf,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Cooperative cancellation flag shared between a sync task and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Convenience for suspension points: error out when cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Generate a fresh base32 alias for an entry.
pub fn new_alias() -> String {
    let mut raw = [0u8; 10];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    BASE32_NOPAD.encode(&raw)
}

/// Lexically normalise a vault-relative path. Empty and `.` components are
/// dropped; `..` is rejected so no path can escape the vault root.
pub fn normalize_rel_path(rel: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for comp in rel.split('/') {
        match comp {
            "" | "." => continue,
            ".." => {
                return Err(Error::Unauthorized(format!(
                    "path escapes vault root: {rel}"
                )))
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Final component of a normalised path; "/" for the root.
pub fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("/")
}

/// Parent of a normalised path; "/" stays "/".
pub fn parent_of(rel: &str) -> String {
    match rel.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => rel[..idx].to_string(),
    }
}

/// Every proper ancestor directory of a normalised path, shallowest first.
/// `/a/b/c.txt` yields `/a` and `/a/b`.
pub fn ancestors_of(rel: &str) -> Vec<String> {
    let bytes = rel.as_bytes();
    let mut out = Vec::new();
    for i in 1..bytes.len() {
        if bytes[i] == b'/' {
            out.push(rel[..i].to_string());
        }
    }
    out
}

/// Infer a mime type from the file extension.
pub fn infer_mime_type(rel: &str) -> &'static str {
    let ext = rel.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_dot_and_empty_components() {
        assert_eq!(normalize_rel_path("a//b/./c").unwrap(), "/a/b/c");
        assert_eq!(normalize_rel_path("/a/b").unwrap(), "/a/b");
        assert_eq!(normalize_rel_path("").unwrap(), "/");
        assert_eq!(normalize_rel_path("/").unwrap(), "/");
    }

    #[test]
    fn normalize_rejects_parent_escapes() {
        assert!(normalize_rel_path("../etc/passwd").is_err());
        assert!(normalize_rel_path("/a/../../b").is_err());
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_of("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(ancestors_of("/a/b/c.txt"), vec!["/a", "/a/b"]);
        assert!(ancestors_of("/a").is_empty());
    }

    #[test]
    fn mime_inference() {
        assert_eq!(infer_mime_type("/photo.JPG"), "image/jpeg");
        assert_eq!(infer_mime_type("/doc.pdf"), "application/pdf");
        assert_eq!(infer_mime_type("/blob"), "application/octet-stream");
    }

    #[test]
    fn alias_is_base32() {
        let alias = new_alias();
        assert_eq!(alias.len(), 16);
        assert!(BASE32_NOPAD.decode(alias.as_bytes()).is_ok());
    }
}
