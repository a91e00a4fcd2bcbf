//! Plan preflight: quota and free-space bounds checked before any engine
//! mutation. A rejected plan aborts the whole cycle.

use std::path::Path;

use crate::crypto::TAG_SIZE;
use crate::types::Vault;
use crate::{Error, Result};

use super::planner::Plan;

pub const DEFAULT_FREE_SPACE_RESERVE: u64 = 64 * 1024 * 1024;

/// Check a plan against the vault quota and the backing filesystem.
///
/// Upload bytes (plus the per-file GCM tag when payloads are encrypted
/// upstream) are bounded by the remaining quota. Download bytes are bounded
/// by free space on the backing filesystem minus a safety reserve.
pub fn check(
    plan: &Plan,
    vault: &Vault,
    remote_used: u64,
    backing_root: &Path,
    encrypt_upstream: bool,
    reserve: u64,
) -> Result<()> {
    let mut upload_bytes = plan.upload_bytes();
    if encrypt_upstream {
        upload_bytes += plan.upload_files() * TAG_SIZE as u64;
    }

    if vault.quota > 0 && upload_bytes > 0 {
        let remaining = vault.quota.saturating_sub(remote_used);
        if upload_bytes > remaining {
            return Err(Error::preflight(format!(
                "plan uploads {upload_bytes} bytes but vault '{}' has {remaining} of quota left",
                vault.name
            )));
        }
    }

    let download_bytes = plan.download_bytes();
    if download_bytes > 0 {
        let free = fs2::free_space(backing_root)?;
        let usable = free.saturating_sub(reserve);
        if download_bytes > usable {
            return Err(Error::preflight(format!(
                "plan downloads {download_bytes} bytes but only {usable} are free under {}",
                backing_root.display()
            )));
        }
    }

    Ok(())
}
