//! Integration tests for the background sync scheduler.
//!
//! These run real account databases in a temp directory against an
//! in-process remote provider.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_test::assert_ok;

use common::{FakeRemote, eventually, init_tracing, manager};
use mailcache_core::store::SyncResource;
use mailcache_core::sync::{SkipReason, SyncMetrics};
use mailcache_core::{
    AccountGrant, ActionPayload, OnlineStatus, RemoteProvider, SyncOptions, SyncScheduler,
    find_conflicts, unified_search,
};

fn scheduler(
    manager: Arc<mailcache_core::CacheManager>,
    remote: Arc<FakeRemote>,
    options: SyncOptions,
) -> SyncScheduler {
    let remote: Arc<dyn RemoteProvider> = remote;
    SyncScheduler::new(
        manager,
        Some(remote),
        Arc::new(OnlineStatus::default()),
        Arc::new(SyncMetrics::new()),
        options,
    )
}

#[tokio::test]
async fn test_accounts_sync_independently() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let remote = Arc::new(FakeRemote::default());
    let scheduler = scheduler(Arc::clone(&manager), Arc::clone(&remote), SyncOptions::default());

    let started = scheduler
        .start_all([
            AccountGrant::new("alice@example.com", "g-alice"),
            AccountGrant::new("bob@example.com", "g-bob"),
        ])
        .await;
    assert_eq!(started, 2);

    let metrics = Arc::clone(scheduler.metrics());
    assert!(eventually(|| metrics.snapshot().items_synced >= 14).await);
    scheduler.shutdown().await;

    for (email, grant) in [("alice@example.com", "g-alice"), ("bob@example.com", "g-bob")] {
        let cache = assert_ok!(manager.account(email).await);
        let ids: Vec<_> = assert_ok!(cache.emails().search("budget", 10).await)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![format!("{grant}-m1")]);
        assert_eq!(assert_ok!(cache.folders().count().await), 2);
    }
}

#[tokio::test]
async fn test_checkpoints_never_move_backwards() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let remote = Arc::new(FakeRemote::default());
    let scheduler = scheduler(Arc::clone(&manager), remote, SyncOptions::default());
    let grant = AccountGrant::new("alice@example.com", "g-alice");

    scheduler.sync_now(&grant).await;
    let cache = assert_ok!(manager.account(&grant.email).await);
    let first = assert_ok!(cache.sync_state().get("emails").await).unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    scheduler.sync_now(&grant).await;
    let second = assert_ok!(cache.sync_state().get("emails").await).unwrap();
    assert!(second.last_sync >= first.last_sync);

    for resource in SyncResource::ALL {
        assert!(assert_ok!(cache.sync_state().get(resource.as_str()).await).is_some());
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_cycle() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let (remote, entered, _release) = FakeRemote::gated();
    let remote = Arc::new(remote);
    let scheduler = scheduler(Arc::clone(&manager), Arc::clone(&remote), SyncOptions::default());

    assert!(scheduler.start(AccountGrant::new("alice@example.com", "g-alice")).await);
    entered.notified().await;

    let finished = tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown()).await;
    assert!(finished.is_ok(), "shutdown waited for the blocked cycle");
    assert_eq!(remote.message_calls.load(Ordering::SeqCst), 1);

    let cache = assert_ok!(manager.account("alice@example.com").await);
    assert!(assert_ok!(cache.sync_state().get("emails").await).is_none());
}

#[tokio::test]
async fn test_sync_now_skips_while_a_loop_cycle_runs() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let (remote, entered, release) = FakeRemote::gated();
    let remote = Arc::new(remote);
    let scheduler = scheduler(Arc::clone(&manager), Arc::clone(&remote), SyncOptions::default());
    let grant = AccountGrant::new("alice@example.com", "g-alice");

    assert!(scheduler.start(grant.clone()).await);
    entered.notified().await;

    let report = scheduler.sync_now(&grant).await;
    assert_eq!(report.skipped, Some(SkipReason::AlreadySyncing));
    assert!(report.synced.is_empty());
    assert_eq!(remote.message_calls.load(Ordering::SeqCst), 1);

    release.notify_one();
    let metrics = Arc::clone(scheduler.metrics());
    assert!(eventually(|| metrics.snapshot().items_synced >= 7).await);

    // once the loop's cycle is over the account can be synced again
    release.notify_one();
    let mut report = scheduler.sync_now(&grant).await;
    for _ in 0..100 {
        if report.skipped.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        report = scheduler.sync_now(&grant).await;
    }
    assert_eq!(report.synced_count(SyncResource::Emails), Some(2));
    assert_eq!(remote.message_calls.load(Ordering::SeqCst), 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_clearing_cache_mid_cycle_aborts_only_that_cycle() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let (remote, entered, release) = FakeRemote::gated();
    let remote = Arc::new(remote);
    let scheduler = Arc::new(scheduler(
        Arc::clone(&manager),
        Arc::clone(&remote),
        SyncOptions::default(),
    ));
    let grant = AccountGrant::new("alice@example.com", "g-alice");

    let running = {
        let scheduler = Arc::clone(&scheduler);
        let grant = grant.clone();
        tokio::spawn(async move { scheduler.sync_now(&grant).await })
    };
    entered.notified().await;
    assert_ok!(manager.clear_cache(&grant.email).await);
    release.notify_one();

    let report = running.await.unwrap();
    assert!(report.aborted.is_some());
    assert!(scheduler.online().is_online());

    // the next cycle reopens a fresh database
    release.notify_one();
    let report = scheduler.sync_now(&grant).await;
    assert!(report.aborted.is_none());
    assert_eq!(report.synced_count(SyncResource::Emails), Some(2));
}

#[tokio::test]
async fn test_offline_writes_replay_when_back_online() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let remote = Arc::new(FakeRemote::default());
    remote.fail_messages.store(true, Ordering::SeqCst);
    let scheduler = scheduler(Arc::clone(&manager), Arc::clone(&remote), SyncOptions::default());
    let grant = AccountGrant::new("alice@example.com", "g-alice");

    scheduler.sync_now(&grant).await;
    assert!(!scheduler.online().is_online());
    assert_eq!(
        scheduler.sync_now(&grant).await.skipped,
        Some(SkipReason::Offline)
    );

    let cache = assert_ok!(manager.account(&grant.email).await);
    for payload in [
        ActionPayload::MarkRead {
            email_id: "m1".to_string(),
        },
        ActionPayload::Archive {
            email_id: "m1".to_string(),
        },
    ] {
        assert_ok!(cache.queue().enqueue(&payload).await);
    }

    remote.fail_messages.store(false, Ordering::SeqCst);
    assert!(scheduler.start(grant.clone()).await);
    let reports = scheduler.set_online(true).await;
    scheduler.shutdown().await;

    let applied: usize = reports.iter().map(|r| r.applied).sum();
    assert!(applied <= 2);
    assert_eq!(
        remote.writes(),
        vec!["update:m1:Some(false)".to_string(), "archive:m1".to_string()]
    );
    assert_eq!(assert_ok!(cache.queue().count().await), 0);
}

#[tokio::test]
async fn test_synced_data_feeds_search_and_conflicts() {
    init_tracing();
    let (_dir, manager) = manager().await;
    let remote = Arc::new(FakeRemote::default());
    let scheduler = scheduler(Arc::clone(&manager), remote, SyncOptions::default());
    let grant = AccountGrant::new("alice@example.com", "g-alice");
    scheduler.sync_now(&grant).await;

    let cache = assert_ok!(manager.account(&grant.email).await);
    let results = unified_search(cache.as_ref(), "budget", 20).await;
    let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["g-alice-m1", "budget-review", "finance"]);

    let events = assert_ok!(cache.events().upcoming(10).await);
    let conflicts = find_conflicts(&events);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].first.id, "budget-review");
    assert_eq!(conflicts[0].second.id, "one-on-one");
}
