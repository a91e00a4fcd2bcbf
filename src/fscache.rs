//! Shared inode/path/entry cache
//!
//! The FUSE layer and the sync engine both resolve identity through this
//! structure, so updates happen atomically with respect to lookups: a
//! concurrent `lookup` sees the pre-state or the post-state, never a torn
//! one. Inodes start at 2 (1 is the FUSE root) and are never reused within
//! a mount, even after eviction.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};

use crate::types::{Entry, Inode, VaultId};

pub const ROOT_INODE: Inode = 1;
const FIRST_INODE: Inode = 2;

/// Cache key: vault plus normalised vault-relative path.
pub type VaultPath = (VaultId, String);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entry: Entry,
    pub vault_path: String,
    /// Absolute backing path (local vaults) or materialised cache path.
    pub abs_path: PathBuf,
    pub inode: Inode,
}

#[derive(Default)]
struct HandleState {
    count: u32,
    /// Evict the mapping once the last handle closes.
    evict_on_zero: bool,
    /// Remove the backing file once the last handle closes (cache mode).
    free_backing_on_zero: bool,
}

struct CacheInner {
    next_inode: Inode,
    next_entry_id: u64,
    path_to_inode: HashMap<VaultPath, Inode>,
    inode_to_entry: HashMap<Inode, CacheEntry>,
    /// FUSE nlookup bookkeeping per inode.
    nlookup: HashMap<Inode, u64>,
}

/// What `close_handle` asks the caller to do once a deferred action fires.
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    pub evicted: Option<CacheEntry>,
    /// Backing path to remove, for entries downloaded with free-after-use.
    pub free_backing: Option<PathBuf>,
}

pub struct FsCache {
    inner: RwLock<CacheInner>,
    handles: Mutex<HashMap<Inode, HandleState>>,
}

impl Default for FsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FsCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                next_inode: FIRST_INODE,
                next_entry_id: 1,
                path_to_inode: HashMap::new(),
                inode_to_entry: HashMap::new(),
                nlookup: HashMap::new(),
            }),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace by path. An inode already assigned to the path is
    /// reused; entry ids are assigned on first insertion.
    pub fn cache(&self, mut entry: Entry) -> Inode {
        let mut inner = self.inner.write();
        let key = (entry.vault_id, entry.path.clone());
        let inode = match inner.path_to_inode.get(&key).copied() {
            Some(ino) => ino,
            None => {
                let ino = inner.next_inode;
                inner.next_inode += 1;
                inner.path_to_inode.insert(key.clone(), ino);
                ino
            }
        };
        if entry.id == 0 {
            match inner.inode_to_entry.get(&inode).map(|c| c.entry.id) {
                Some(existing_id) => entry.id = existing_id,
                None => {
                    entry.id = inner.next_entry_id;
                    inner.next_entry_id += 1;
                }
            }
        }
        entry.inode = Some(inode);
        let abs_path = entry.cache_path.clone().unwrap_or_default();
        inner.inode_to_entry.insert(
            inode,
            CacheEntry {
                vault_path: entry.path.clone(),
                abs_path,
                inode,
                entry,
            },
        );
        inode
    }

    /// Idempotent inode assignment for a path observed before its entry.
    pub fn assign_inode(&self, vault_id: VaultId, rel: &str) -> Inode {
        let mut inner = self.inner.write();
        let key = (vault_id, rel.to_string());
        if let Some(ino) = inner.path_to_inode.get(&key) {
            return *ino;
        }
        let ino = inner.next_inode;
        inner.next_inode += 1;
        inner.path_to_inode.insert(key, ino);
        ino
    }

    pub fn resolve_inode(&self, vault_id: VaultId, rel: &str) -> Option<Inode> {
        self.inner
            .read()
            .path_to_inode
            .get(&(vault_id, rel.to_string()))
            .copied()
    }

    pub fn resolve_path(&self, inode: Inode) -> Option<VaultPath> {
        self.inner
            .read()
            .inode_to_entry
            .get(&inode)
            .map(|c| (c.entry.vault_id, c.vault_path.clone()))
    }

    pub fn entry_by_inode(&self, inode: Inode) -> Option<Entry> {
        self.inner
            .read()
            .inode_to_entry
            .get(&inode)
            .map(|c| c.entry.clone())
    }

    pub fn entry_by_path(&self, vault_id: VaultId, rel: &str) -> Option<Entry> {
        let inner = self.inner.read();
        let ino = inner.path_to_inode.get(&(vault_id, rel.to_string()))?;
        inner.inode_to_entry.get(ino).map(|c| c.entry.clone())
    }

    pub fn exists(&self, vault_id: VaultId, rel: &str) -> bool {
        self.inner
            .read()
            .path_to_inode
            .contains_key(&(vault_id, rel.to_string()))
    }

    /// Evict both directions. With open handles the eviction is deferred
    /// until the last handle closes.
    pub fn evict_by_path(&self, vault_id: VaultId, rel: &str) -> Option<CacheEntry> {
        let inode = self.resolve_inode(vault_id, rel)?;
        self.evict_by_inode(inode)
    }

    /// Evict both directions. Returns the removed entry, or `None` when the
    /// inode is unknown or the eviction was deferred behind open handles.
    pub fn evict_by_inode(&self, inode: Inode) -> Option<CacheEntry> {
        {
            let mut handles = self.handles.lock();
            if let Some(state) = handles.get_mut(&inode) {
                if state.count > 0 {
                    state.evict_on_zero = true;
                    return None;
                }
            }
            handles.remove(&inode);
        }
        self.evict_now(inode)
    }

    fn evict_now(&self, inode: Inode) -> Option<CacheEntry> {
        let mut inner = self.inner.write();
        let cached = inner.inode_to_entry.remove(&inode)?;
        inner
            .path_to_inode
            .remove(&(cached.entry.vault_id, cached.vault_path.clone()));
        inner.nlookup.remove(&inode);
        Some(cached)
    }

    /// FUSE forget bookkeeping.
    pub fn decrement_ref(&self, inode: Inode, nlookup: u64) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.nlookup.get_mut(&inode) {
            *count = count.saturating_sub(nlookup);
        }
    }

    pub fn increment_ref(&self, inode: Inode) -> u64 {
        let mut inner = self.inner.write();
        let count = inner.nlookup.entry(inode).or_insert(0);
        *count += 1;
        *count
    }

    pub fn open_handle(&self, inode: Inode) -> u32 {
        let mut handles = self.handles.lock();
        let state = handles.entry(inode).or_default();
        state.count += 1;
        state.count
    }

    /// Close one handle. Deferred evictions and backing-file frees fire
    /// when the count reaches zero, and the caller performs the disk work.
    pub fn close_handle(&self, inode: Inode) -> ReleaseOutcome {
        let (evict, free_backing) = {
            let mut handles = self.handles.lock();
            let Some(state) = handles.get_mut(&inode) else {
                return ReleaseOutcome::default();
            };
            state.count = state.count.saturating_sub(1);
            if state.count > 0 {
                return ReleaseOutcome::default();
            }
            let fired = (state.evict_on_zero, state.free_backing_on_zero);
            handles.remove(&inode);
            fired
        };

        let mut outcome = ReleaseOutcome::default();
        if evict {
            outcome.evicted = self.evict_now(inode);
            if let Some(cached) = &outcome.evicted {
                if free_backing {
                    outcome.free_backing = Some(cached.abs_path.clone());
                }
            }
        } else if free_backing {
            let path = self
                .inner
                .read()
                .inode_to_entry
                .get(&inode)
                .map(|c| c.abs_path.clone());
            outcome.free_backing = path;
        }
        outcome
    }

    /// Arrange for the backing file to be removed once the last open handle
    /// closes; fires immediately when nothing holds the file open.
    pub fn free_backing_after_use(&self, inode: Inode) -> Option<PathBuf> {
        let mut handles = self.handles.lock();
        match handles.get_mut(&inode) {
            Some(state) if state.count > 0 => {
                state.free_backing_on_zero = true;
                None
            }
            _ => self
                .inner
                .read()
                .inode_to_entry
                .get(&inode)
                .map(|c| c.abs_path.clone()),
        }
    }

    pub fn handle_count(&self, inode: Inode) -> u32 {
        self.handles.lock().get(&inode).map(|s| s.count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.read().inode_to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
