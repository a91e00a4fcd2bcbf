//! Vaulthalla - a multi-vault file sync daemon
//!
//! Vaulthalla mounts user vaults backed by local disk or S3-compatible
//! object storage behind one FUSE-exposed tree and keeps each vault's two
//! sides reconciled:
//! - A uniform storage engine contract over local disk and SigV4 S3
//! - A policy-driven sync engine (planner, preflight, bounded executor,
//!   per-vault scheduler)
//! - A shared inode cache consulted by FUSE and updated by sync
//! - Per-vault AES-256-GCM data keys wrapped under a sealed master key

pub mod config;
pub mod crypto;
pub mod error;
pub mod fscache;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
