//! Planner properties and concrete scenarios
//!
//! These tests pin the planner's contract: purity, group ordering,
//! idempotence on agreeing listings, conflict policy coverage and mirror
//! exclusivity.

use chrono::{TimeZone, Utc};
use vaulthalla::sync::planner::{build, to_listing, Action, Listing};
use vaulthalla::sync::policy::{ConflictPolicy, RemotePolicy, Strategy};
use vaulthalla::types::{EntryKind, FileMeta};

fn policy(strategy: Strategy, conflict_policy: ConflictPolicy) -> RemotePolicy {
    let mut p = RemotePolicy {
        id: 1,
        vault_id: 1,
        interval_secs: 60,
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

fn file(path: &str, hash: &str, modified_secs: i64) -> FileMeta {
    FileMeta {
        rel_path: path.to_string(),
        size: 10,
        modified: Utc.timestamp_opt(modified_secs, 0).unwrap(),
        hash: Some(hash.to_string()),
        kind: EntryKind::File,
    }
}

fn listing(files: &[FileMeta]) -> Listing {
    to_listing(files.to_vec())
}

/// Scenario: empty on both sides produces an empty plan.
#[test]
fn test_empty_sync_plans_nothing() {
    let plan = build(
        &Listing::new(),
        &Listing::new(),
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );
    assert!(plan.is_empty());
    assert!(plan.conflicts.is_empty());
}

/// Identical inputs yield identical plans.
#[test]
fn test_build_is_deterministic() {
    let local = listing(&[
        file("/a.txt", "h1", 100),
        file("/dir/b.txt", "h2", 100),
        file("/conflict.txt", "x", 100),
    ]);
    let remote = listing(&[
        file("/c.txt", "h3", 100),
        file("/conflict.txt", "y", 200),
    ]);
    let p = policy(Strategy::Sync, ConflictPolicy::KeepNewest);

    let first = build(&local, &remote, &p);
    let second = build(&local, &remote, &p);
    assert_eq!(first, second);
}

/// Scenario: a single local-only file becomes one upload.
#[test]
fn test_initial_upload() {
    let local = listing(&[file("/a.txt", "H1", 100)]);
    let plan = build(
        &local,
        &Listing::new(),
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );

    assert_eq!(plan.actions.len(), 1);
    match &plan.actions[0] {
        Action::Upload { key, local } => {
            assert_eq!(key, "/a.txt");
            assert_eq!(local.hash.as_deref(), Some("H1"));
        }
        other => panic!("expected an upload, got {other:?}"),
    }
}

/// Agreeing content hashes produce no transfer or delete actions.
#[test]
fn test_content_idempotence() {
    let both = listing(&[
        file("/a.txt", "same-a", 100),
        file("/d/b.txt", "same-b", 500),
    ]);
    for strategy in [Strategy::Cache, Strategy::Sync, Strategy::Mirror] {
        for conflict in [
            ConflictPolicy::KeepLocal,
            ConflictPolicy::KeepRemote,
            ConflictPolicy::KeepNewest,
            ConflictPolicy::Ask,
        ] {
            let plan = build(&both, &both, &policy(strategy, conflict));
            assert!(
                plan.is_empty(),
                "{strategy:?}/{conflict:?} planned {:?} on agreeing listings",
                plan.actions
            );
        }
    }
}

/// Every directional conflict policy emits exactly one action per
/// diverging path; Ask emits none and surfaces a conflict instead.
#[test]
fn test_conflict_policy_coverage() {
    let local = listing(&[file("/f", "local-hash", 100)]);
    let remote = listing(&[file("/f", "remote-hash", 200)]);

    for (conflict, expect_download) in [
        (ConflictPolicy::KeepLocal, false),
        (ConflictPolicy::KeepRemote, true),
        (ConflictPolicy::KeepNewest, true),
    ] {
        let plan = build(&local, &remote, &policy(Strategy::Sync, conflict));
        assert_eq!(plan.actions.len(), 1, "{conflict:?}");
        match (&plan.actions[0], expect_download) {
            (Action::Download { key, .. }, true) => assert_eq!(key, "/f"),
            (Action::Upload { key, .. }, false) => assert_eq!(key, "/f"),
            (other, _) => panic!("{conflict:?} planned {other:?}"),
        }
        assert!(plan.conflicts.is_empty());
    }

    let plan = build(&local, &remote, &policy(Strategy::Sync, ConflictPolicy::Ask));
    assert!(plan.actions.is_empty());
    assert_eq!(plan.conflicts.len(), 1);
    assert_eq!(plan.conflicts[0].path, "/f");
    assert_eq!(plan.conflicts[0].local_hash.as_deref(), Some("local-hash"));
}

/// Scenario: KeepNewest downloads when the remote side is strictly newer.
#[test]
fn test_keep_newest_downloads_newer_remote() {
    let local = listing(&[file("/f", "old", 100)]);
    let remote = listing(&[file("/f", "new", 200)]);
    let plan = build(
        &local,
        &remote,
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );

    assert_eq!(plan.actions.len(), 1);
    assert!(matches!(&plan.actions[0], Action::Download { key, .. } if key == "/f"));
}

/// Scenario: mirror toward remote uploads the local-only file and deletes
/// the remote leftover; an agreeing overlap stays untouched.
#[test]
fn test_mirror_local_to_remote() {
    let local = listing(&[file("/x", "hx", 100), file("/y", "hy", 100)]);
    let remote = listing(&[file("/y", "hy", 100), file("/z", "hz", 100)]);
    let plan = build(
        &local,
        &remote,
        &policy(Strategy::Mirror, ConflictPolicy::KeepLocal),
    );

    assert_eq!(plan.actions.len(), 2);
    assert!(matches!(&plan.actions[0], Action::Upload { key, .. } if key == "/x"));
    assert!(matches!(&plan.actions[1], Action::DeleteRemote { key, .. } if key == "/z"));
}

/// Mirror toward local is the symmetric case.
#[test]
fn test_mirror_remote_to_local() {
    let local = listing(&[file("/x", "hx", 100), file("/y", "hy", 100)]);
    let remote = listing(&[file("/y", "hy", 100), file("/z", "hz", 100)]);
    let plan = build(
        &local,
        &remote,
        &policy(Strategy::Mirror, ConflictPolicy::KeepRemote),
    );

    assert_eq!(plan.actions.len(), 2);
    assert!(matches!(&plan.actions[0], Action::Download { key, .. } if key == "/z"));
    assert!(matches!(&plan.actions[1], Action::DeleteLocal { key, .. } if key == "/x"));
}

/// Under Mirror no path gets both an upload and a download.
#[test]
fn test_mirror_exclusivity() {
    let local = listing(&[
        file("/a", "1", 100),
        file("/b", "2", 300),
        file("/c", "3", 100),
    ]);
    let remote = listing(&[
        file("/b", "other", 100),
        file("/c", "3", 100),
        file("/d", "4", 100),
    ]);

    for conflict in [ConflictPolicy::KeepLocal, ConflictPolicy::KeepRemote] {
        let plan = build(&local, &remote, &policy(Strategy::Mirror, conflict));
        for action in &plan.actions {
            let key = action.key().to_string();
            let both_ways = plan.actions.iter().any(|a| {
                a.key() == key
                    && matches!(a, Action::Upload { .. })
                    && matches!(action, Action::Download { .. })
            });
            assert!(!both_ways, "path {key} planned in both directions");
        }
    }
}

/// Directories for new files are ensured ahead of every transfer, and the
/// group order is directories, uploads, downloads, deletes.
#[test]
fn test_plan_group_ordering() {
    let local = listing(&[
        file("/new/deep/a.txt", "ha", 100),
        file("/stale", "gone", 100),
    ]);
    let remote = listing(&[
        file("/fetch/b.txt", "hb", 100),
        file("/stale", "kept", 300),
    ]);
    let plan = build(
        &local,
        &remote,
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );

    let order: Vec<u8> = plan
        .actions
        .iter()
        .map(|a| match a {
            Action::EnsureDirectories { .. } => 0,
            Action::Upload { .. } => 1,
            Action::Download { .. } => 2,
            Action::DeleteRemote { .. } => 3,
            Action::DeleteLocal { .. } => 4,
        })
        .collect();
    let mut sorted = order.clone();
    sorted.sort_unstable();
    assert_eq!(order, sorted, "groups out of order: {:?}", plan.actions);

    match &plan.actions[0] {
        Action::EnsureDirectories { dirs } => {
            // Missing prefixes of both transfer targets, shallowest first.
            assert_eq!(
                dirs,
                &vec![
                    "/fetch".to_string(),
                    "/new".to_string(),
                    "/new/deep".to_string()
                ]
            );
        }
        other => panic!("expected directories first, got {other:?}"),
    }
}

/// Cache strategy downloads carry the free-after-download hint.
#[test]
fn test_cache_strategy_marks_downloads() {
    let remote = listing(&[file("/big.bin", "h", 100)]);
    let plan = build(
        &Listing::new(),
        &remote,
        &policy(Strategy::Cache, ConflictPolicy::KeepNewest),
    );

    assert_eq!(plan.actions.len(), 1);
    match &plan.actions[0] {
        Action::Download {
            free_after_download,
            ..
        } => assert!(free_after_download),
        other => panic!("expected a download, got {other:?}"),
    }

    // The same download under Sync keeps its bytes.
    let plan = build(
        &Listing::new(),
        &remote,
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );
    assert!(matches!(
        &plan.actions[0],
        Action::Download { free_after_download: false, .. }
    ));
}

/// Lexicographic order within each group.
#[test]
fn test_actions_sorted_within_groups() {
    let local = listing(&[
        file("/b.txt", "1", 100),
        file("/a.txt", "2", 100),
        file("/c/z.txt", "3", 100),
    ]);
    let plan = build(
        &local,
        &Listing::new(),
        &policy(Strategy::Sync, ConflictPolicy::KeepNewest),
    );

    let uploads: Vec<&str> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            Action::Upload { key, .. } => Some(key.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(uploads, vec!["/a.txt", "/b.txt", "/c/z.txt"]);
}
