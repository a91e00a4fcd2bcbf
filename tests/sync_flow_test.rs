//! End-to-end sync flows over two local engines
//!
//! The remote side is a second disk-backed engine, which keeps the full
//! planner -> preflight -> executor -> cache pipeline observable without a
//! network. Controller scheduling is exercised at the end.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use vaulthalla::fscache::FsCache;
use vaulthalla::storage::{LocalDiskEngine, StorageEngine, StorageManager};
use vaulthalla::store::{EventStore, MemoryStore, OperationStore, PolicyStore};
use vaulthalla::sync::operations::{OpKind, OpTarget, Operation};
use vaulthalla::sync::planner::{build, to_listing};
use vaulthalla::sync::policy::{ConflictPolicy, RemotePolicy, Strategy};
use vaulthalla::sync::{ExecutorConfig, PlanExecutor, SyncController, SyncStatus};
use vaulthalla::types::{CancelFlag, Vault, VaultType};

struct Fixture {
    _local_dir: TempDir,
    _remote_dir: TempDir,
    local: Arc<LocalDiskEngine>,
    remote: Arc<LocalDiskEngine>,
    cache: Arc<FsCache>,
    vault: Vault,
}

fn fixture(quota: u64) -> Fixture {
    let local_dir = TempDir::new().unwrap();
    let remote_dir = TempDir::new().unwrap();
    let local = Arc::new(LocalDiskEngine::new(local_dir.path()).unwrap());
    let remote = Arc::new(LocalDiskEngine::new(remote_dir.path()).unwrap());
    let vault = Vault {
        id: 1,
        owner_id: 1,
        name: "docs".to_string(),
        quota,
        vault_type: VaultType::S3,
        mount_point: "/mnt/docs".into(),
        backing_path: local_dir.path().to_path_buf(),
        is_active: true,
        created_at: chrono::Utc::now(),
    };
    Fixture {
        _local_dir: local_dir,
        _remote_dir: remote_dir,
        local,
        remote,
        cache: Arc::new(FsCache::new()),
        vault,
    }
}

fn policy(strategy: Strategy, conflict_policy: ConflictPolicy) -> RemotePolicy {
    let mut p = RemotePolicy {
        id: 1,
        vault_id: 1,
        interval_secs: 1,
        enabled: true,
        last_sync_at: None,
        last_success_at: None,
        strategy,
        conflict_policy,
        encrypt_upstream: false,
        config_hash: String::new(),
    };
    p.rehash_config();
    p
}

async fn run_plan(
    fx: &Fixture,
    policy: &RemotePolicy,
    cancel: CancelFlag,
) -> vaulthalla::Result<vaulthalla::sync::SyncOutcome> {
    let local_listing = fx.local.list("/", true).await.unwrap();
    let remote_listing = fx.remote.list("/", true).await.unwrap();
    let remote_used: u64 = remote_listing.iter().map(|m| m.size).sum();
    let plan = build(
        &to_listing(local_listing),
        &to_listing(remote_listing),
        policy,
    );

    let local: Arc<dyn StorageEngine> = fx.local.clone();
    let remote: Arc<dyn StorageEngine> = fx.remote.clone();
    Arc::new(PlanExecutor::new(
        fx.vault.clone(),
        policy.clone(),
        local,
        remote,
        Arc::clone(&fx.cache),
        cancel,
        ExecutorConfig {
            max_inflight: 4,
            free_space_reserve: 0,
        },
    ))
    .execute(plan, remote_used)
    .await
}

/// Test initial upload: a local-only file reaches the remote and gains a
/// stable inode in the FS cache.
#[tokio::test]
async fn test_initial_upload_flow() {
    let fx = fixture(0);
    fx.local
        .write("/a.txt", Bytes::from("0123456789"), false)
        .await
        .unwrap();

    let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.executed, 1);
    assert!(outcome.failures.is_empty());

    assert_eq!(
        fx.remote.read("/a.txt").await.unwrap(),
        Bytes::from("0123456789")
    );

    let inode = fx.cache.resolve_inode(1, "/a.txt").expect("cached inode");
    assert_eq!(
        fx.cache.resolve_path(inode),
        Some((1, "/a.txt".to_string()))
    );

    // A second cycle over agreeing listings does nothing.
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.executed, 0);
    assert_eq!(fx.cache.resolve_inode(1, "/a.txt"), Some(inode));
}

/// Test conflict execution: the keep-remote direction replaces the local
/// bytes with the remote ones.
#[tokio::test]
async fn test_keep_remote_conflict_downloads() {
    let fx = fixture(0);
    fx.local
        .write("/f", Bytes::from("local version"), false)
        .await
        .unwrap();
    fx.remote
        .write("/f", Bytes::from("remote version"), false)
        .await
        .unwrap();

    let p = policy(Strategy::Sync, ConflictPolicy::KeepRemote);
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert!(outcome.failures.is_empty());

    assert_eq!(
        fx.local.read("/f").await.unwrap(),
        Bytes::from("remote version")
    );
    // Local materialisation now agrees with the remote listing hash.
    let local_stat = fx.local.stat("/f").await.unwrap();
    let remote_stat = fx.remote.stat("/f").await.unwrap();
    assert_eq!(local_stat.hash, remote_stat.hash);
}

/// Test mirror toward remote: leftovers on the remote side are deleted and
/// the shared path with equal content is left alone.
#[tokio::test]
async fn test_mirror_deletes_remote_leftovers() {
    let fx = fixture(0);
    fx.local.write("/x", Bytes::from("xx"), false).await.unwrap();
    fx.local.write("/y", Bytes::from("yy"), false).await.unwrap();
    fx.remote.write("/y", Bytes::from("yy"), false).await.unwrap();
    fx.remote.write("/z", Bytes::from("zz"), false).await.unwrap();

    let p = policy(Strategy::Mirror, ConflictPolicy::KeepLocal);
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert!(outcome.failures.is_empty());

    assert!(fx.remote.exists("/x").await.unwrap());
    assert!(fx.remote.exists("/y").await.unwrap());
    assert!(!fx.remote.exists("/z").await.unwrap());
}

/// Test local delete: the cache eviction happens with the engine delete,
/// and both resolutions go away together.
#[tokio::test]
async fn test_delete_local_evicts_cache() {
    let fx = fixture(0);
    fx.local
        .write("/stale", Bytes::from("old"), false)
        .await
        .unwrap();
    fx.remote
        .write("/keep", Bytes::from("kk"), false)
        .await
        .unwrap();

    // Seed the cache the way a previous cycle would have.
    let p_sync = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
    run_plan(&fx, &p_sync, CancelFlag::new()).await.unwrap();
    let inode = fx.cache.resolve_inode(1, "/stale").expect("seeded");

    // The remote copy disappears out of band; mirroring toward local must
    // now drop the local leftover.
    fx.remote.delete("/stale").await.unwrap();

    let p = policy(Strategy::Mirror, ConflictPolicy::KeepRemote);
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert!(outcome.failures.is_empty());

    assert!(!fx.local.exists("/stale").await.unwrap());
    assert_eq!(fx.cache.resolve_inode(1, "/stale"), None);
    assert_eq!(fx.cache.resolve_path(inode), None);
}

/// Test preflight rejection: a plan over quota aborts before any engine
/// mutation reaches the remote.
#[tokio::test]
async fn test_preflight_rejects_over_quota_without_mutation() {
    let fx = fixture(10);
    fx.local
        .write("/big.bin", Bytes::from(vec![7u8; 11]), false)
        .await
        .unwrap();

    let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
    let err = run_plan(&fx, &p, CancelFlag::new()).await.unwrap_err();
    assert_eq!(err.kind(), "preflight_space");

    assert!(fx.remote.list("/", true).await.unwrap().is_empty());
}

/// Test cancellation: a pre-cancelled task executes nothing.
#[tokio::test]
async fn test_cancelled_plan_aborts() {
    let fx = fixture(0);
    fx.local
        .write("/pending", Bytes::from("data"), false)
        .await
        .unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);
    let err = run_plan(&fx, &p, cancel).await.unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    assert!(!fx.remote.exists("/pending").await.unwrap());
}

/// Test cache trim: materialised bytes above the quota are freed oldest
/// first while identity mappings survive for re-download.
#[tokio::test]
async fn test_cache_strategy_trims_to_quota() {
    let fx = fixture(4);
    fx.remote
        .write("/cold.bin", Bytes::from(vec![1u8; 8]), false)
        .await
        .unwrap();

    let p = policy(Strategy::Cache, ConflictPolicy::KeepNewest);
    let outcome = run_plan(&fx, &p, CancelFlag::new()).await.unwrap();
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.trimmed_bytes, 8);

    // Bytes are gone, identity is not: the next access can re-download.
    assert!(!fx.local.exists("/cold.bin").await.unwrap());
    assert!(fx.cache.resolve_inode(1, "/cold.bin").is_some());
}

/// Test the controller end to end: replay runs ahead of planning, the
/// cycle records a successful event, and the vault never runs twice at
/// once.
#[tokio::test]
async fn test_controller_cycle_with_replay() {
    let fx = fixture(0);
    fx.local
        .write("/report.txt", Bytes::from("v1"), false)
        .await
        .unwrap();
    fx.remote
        .write("/old-name.txt", Bytes::from("payload"), false)
        .await
        .unwrap();

    let storage = Arc::new(StorageManager::new());
    let remote_engine: Arc<dyn StorageEngine> = fx.remote.clone();
    storage.register_s3(fx.vault.clone(), remote_engine, fx.local.clone());

    let store = Arc::new(MemoryStore::new());
    let policies: Arc<dyn PolicyStore> = store.clone();
    policies.upsert(policy(Strategy::Sync, ConflictPolicy::KeepNewest));

    let ops: Arc<dyn OperationStore> = store.clone();
    ops.add(Operation::new(
        1,
        1,
        1,
        OpKind::Rename,
        OpTarget::File,
        "/old-name.txt",
        "/new-name.txt",
    ));

    let controller = SyncController::new(
        Arc::clone(&storage),
        Arc::clone(&fx.cache),
        store.clone(),
        store.clone(),
        store.clone(),
        2,
        ExecutorConfig {
            max_inflight: 4,
            free_space_reserve: 0,
        },
    );
    let handle = controller.start();

    // Wait for the first cycle to finish.
    let events: Arc<dyn EventStore> = store.clone();
    let mut finished = None;
    for _ in 0..100 {
        if let Some(event) = events.latest(1) {
            if event.status != SyncStatus::Running {
                finished = Some(event);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    controller.stop();
    let _ = handle.await;

    let event = finished.expect("a sync cycle completed");
    assert_eq!(event.status, SyncStatus::Success);

    // The rename replayed upstream before planning, so the renamed file
    // came down and the old name is gone everywhere.
    assert!(!fx.remote.exists("/old-name.txt").await.unwrap());
    assert_eq!(
        fx.remote.read("/new-name.txt").await.unwrap(),
        Bytes::from("payload")
    );
    assert_eq!(
        fx.local.read("/new-name.txt").await.unwrap(),
        Bytes::from("payload")
    );
    // And the local-only file went up.
    assert_eq!(
        fx.remote.read("/report.txt").await.unwrap(),
        Bytes::from("v1")
    );

    let health = controller.health(1).expect("health for vault 1");
    assert!(!health.in_flight);
    assert_eq!(health.consecutive_failures, 0);
    assert!(health.last_success_at.is_some());
}
