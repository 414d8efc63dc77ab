use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use depot_sync::app::Depot;
use depot_sync::activity::{ActivityError, ActivityLog};
use depot_sync::config::{self, Config};
use depot_sync::db::{self, PendingStore};
use depot_sync::distribution::{DistributionEngine, DistributionError, NewBucket};
use depot_sync::model::{
    collections, ActivityAction, ActivityLogEntry, Bucket, BucketKind, DistributionResult, InventoryItem,
};
use depot_sync::remote::{Fault, MemoryRemoteStore, RemoteError, RemoteStore};
use depot_sync::retry::RetryPolicy;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

fn engine(lookup_limit: usize, batch_limit: usize) -> (Arc<MemoryRemoteStore>, DistributionEngine) {
    let remote = Arc::new(MemoryRemoteStore::new(lookup_limit, batch_limit));
    let engine = DistributionEngine::new(remote.clone(), fast_retry(3));
    (remote, engine)
}

fn codes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn pallet(engine: &DistributionEngine, id: &str) -> Bucket {
    engine
        .create_bucket(
            NewBucket {
                id: Some(id.into()),
                kind: BucketKind::Pallet,
                display_number: 1,
                manufacturer_tag: Some("ACME".into()),
            },
            "op",
        )
        .await
        .unwrap()
}

async fn latest_entry(remote: &Arc<MemoryRemoteStore>) -> ActivityLogEntry {
    let log = ActivityLog::new(remote.clone(), Vec::new());
    log.recent(1).await.unwrap().remove(0)
}

async fn members(engine: &DistributionEngine, id: &str) -> BTreeSet<String> {
    engine.bucket(id).await.unwrap().unwrap().items
}

/// An item carries a bucket id exactly when one bucket lists it, and that
/// bucket is the one it names.
async fn assert_consistent(remote: &MemoryRemoteStore) {
    let items: Vec<InventoryItem> = remote
        .list(collections::ITEMS)
        .await
        .unwrap()
        .iter()
        .map(|d| d.decode(collections::ITEMS).unwrap())
        .collect();
    let buckets: Vec<Bucket> = remote
        .list(collections::BUCKETS)
        .await
        .unwrap()
        .iter()
        .map(|d| d.decode(collections::BUCKETS).unwrap())
        .collect();

    let mut listed: HashMap<&str, Vec<&str>> = HashMap::new();
    for b in &buckets {
        for code in &b.items {
            listed.entry(code.as_str()).or_default().push(b.id.as_str());
        }
    }
    for item in &items {
        let holders = listed.get(item.id.as_str()).cloned().unwrap_or_default();
        match (&item.bucket_id, item.is_assigned()) {
            (Some(b), true) => assert_eq!(holders, vec![b.as_str()], "item {}", item.id),
            (None, false) => assert!(holders.is_empty(), "item {} listed by {:?}", item.id, holders),
            other => panic!("item {} in mixed state {:?}", item.id, other),
        }
    }
    for (code, holders) in &listed {
        assert_eq!(holders.len(), 1, "{code} listed by {holders:?}");
        assert!(items.iter().any(|i| i.id == *code), "{code} has no item document");
    }
}

#[tokio::test]
async fn remove_then_redistribute_counts_the_survivor_as_duplicate() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;

    let first = engine.distribute("P1", &codes(&["A", "B", "C"]), "op").await.unwrap();
    assert_eq!(
        first,
        DistributionResult {
            added_count: 3,
            duplicate_count: 0
        }
    );

    assert!(engine.remove_item("P1", "B", "op").await.unwrap());
    assert_eq!(members(&engine, "P1").await, BTreeSet::from(["A".into(), "C".into()]));
    assert!(!engine.item("B").await.unwrap().unwrap().is_assigned());

    let second = engine.distribute("P1", &codes(&["B", "C"]), "op").await.unwrap();
    assert_eq!(
        second,
        DistributionResult {
            added_count: 1,
            duplicate_count: 1
        }
    );
    assert_eq!(
        members(&engine, "P1").await,
        BTreeSet::from(["A".into(), "B".into(), "C".into()])
    );
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn resubmitting_codes_changes_nothing() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;

    let submitted = codes(&["A", "A", "B"]);
    let first = engine.distribute("P1", &submitted, "op").await.unwrap();
    assert_eq!(first.added_count, 2);
    assert_eq!(first.duplicate_count, 1);

    let commits = remote.commit_count();
    let again = engine.distribute("P1", &submitted, "op").await.unwrap();
    assert_eq!(again.added_count, 0);
    assert_eq!(again.duplicate_count, 3);
    assert_eq!(remote.commit_count(), commits);
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn item_is_never_claimed_by_two_buckets() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    pallet(&engine, "P2").await;

    engine.distribute("P1", &codes(&["A"]), "op").await.unwrap();
    let result = engine.distribute("P2", &codes(&["A", "D"]), "op").await.unwrap();
    assert_eq!(result.added_count, 1);
    assert_eq!(result.duplicate_count, 1);

    let a = engine.item("A").await.unwrap().unwrap();
    assert_eq!(a.bucket_id.as_deref(), Some("P1"));
    assert_eq!(members(&engine, "P2").await, BTreeSet::from(["D".into()]));
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn lookup_chunking_does_not_change_the_result() {
    let submitted: Vec<String> = (0..10).map(|i| format!("BAT-{i:02}")).collect();

    let (small, chunked) = engine(3, 500);
    pallet(&chunked, "P1").await;
    let a = chunked.distribute("P1", &submitted, "op").await.unwrap();

    let (_, whole) = engine(30, 500);
    pallet(&whole, "P1").await;
    let b = whole.distribute("P1", &submitted, "op").await.unwrap();

    assert_eq!(a, b);
    assert_eq!(a.added_count, 10);
    let mut sizes = small.lookup_sizes();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3, 3, 3]);
    assert_eq!(members(&chunked, "P1").await, members(&whole, "P1").await);
}

#[tokio::test]
async fn oversized_distribution_writes_nothing() {
    let (remote, engine) = engine(30, 5);
    pallet(&engine, "P1").await;

    let err = engine
        .distribute("P1", &codes(&["A", "B", "C", "D"]), "op")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DistributionError::BatchTooLarge {
            required: 6,
            limit: 5
        }
    ));
    assert_eq!(remote.count(collections::ITEMS), 0);
    assert!(members(&engine, "P1").await.is_empty());
}

#[tokio::test]
async fn conflict_is_retried() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;

    remote.push_fault(Fault::Conflict);
    let result = engine.distribute("P1", &codes(&["A", "B"]), "op").await.unwrap();
    assert_eq!(result.added_count, 2);
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn exhausted_retries_leave_no_partial_effect() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    for _ in 0..3 {
        remote.push_fault(Fault::Conflict);
    }

    let err = engine
        .distribute("P1", &codes(&["A", "B"]), "op")
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::RetryExhausted { attempts: 3 }));
    assert!(err.is_retryable());
    assert_eq!(remote.count(collections::ITEMS), 0);
    assert!(members(&engine, "P1").await.is_empty());

    let result = engine.distribute("P1", &codes(&["A", "B"]), "op").await.unwrap();
    assert_eq!(result.added_count, 2);
}

#[tokio::test]
async fn outage_leaves_no_partial_effect() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;

    remote.push_fault(Fault::Unavailable);
    let err = engine
        .distribute("P1", &codes(&["A", "B"]), "op")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DistributionError::Remote(RemoteError::Unavailable(_))
    ));
    assert!(err.is_retryable());
    assert_eq!(remote.count(collections::ITEMS), 0);

    remote.set_offline(true);
    assert!(engine.distribute("P1", &codes(&["A"]), "op").await.is_err());
    remote.set_offline(false);
    assert_eq!(
        engine.distribute("P1", &codes(&["A", "B"]), "op").await.unwrap().added_count,
        2
    );
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn unknown_bucket_is_reported() {
    let (_, engine) = engine(30, 500);
    assert!(matches!(
        engine.distribute("nope", &codes(&["A"]), "op").await,
        Err(DistributionError::BucketNotFound(_))
    ));
    assert!(matches!(
        engine.delete_bucket("nope", "op").await,
        Err(DistributionError::BucketNotFound(_))
    ));
}

#[tokio::test]
async fn creating_an_existing_bucket_fails() {
    let (_, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    let err = engine
        .create_bucket(
            NewBucket {
                id: Some("P1".into()),
                kind: BucketKind::Cell,
                display_number: 2,
                manufacturer_tag: None,
            },
            "op",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::BucketExists(id) if id == "P1"));
}

#[tokio::test]
async fn contention_on_create_is_not_reported_as_existing() {
    let (remote, engine) = engine(30, 500);
    remote.push_fault(Fault::Conflict);
    let err = engine
        .create_bucket(
            NewBucket {
                id: Some("C7".into()),
                kind: BucketKind::Cell,
                display_number: 7,
                manufacturer_tag: None,
            },
            "op",
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DistributionError::Remote(RemoteError::Conflict(_))
    ));
    assert!(err.is_retryable());
    assert!(engine.bucket("C7").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_bucket_releases_every_member() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    engine.distribute("P1", &codes(&["A", "B", "C"]), "op").await.unwrap();

    assert_eq!(engine.delete_bucket("P1", "op").await.unwrap(), 3);
    assert!(engine.bucket("P1").await.unwrap().is_none());
    let entry = latest_entry(&remote).await;
    assert_eq!(entry.action, ActivityAction::DeleteBucket);
    assert_eq!(entry.item_count, 3);
    for code in ["A", "B", "C"] {
        let item = engine.item(code).await.unwrap().unwrap();
        assert!(!item.is_assigned());
        assert!(item.bucket_id.is_none());
    }
    assert_consistent(&remote).await;

    // Released items can be distributed again.
    pallet(&engine, "P2").await;
    let result = engine.distribute("P2", &codes(&["A", "B"]), "op").await.unwrap();
    assert_eq!(result.added_count, 2);
}

#[tokio::test]
async fn delete_of_large_bucket_runs_in_steps() {
    let (remote, engine) = engine(30, 4);
    pallet(&engine, "P1").await;
    for chunk in [["A", "B"].as_slice(), &["C", "D"], &["E"]] {
        engine.distribute("P1", &codes(chunk), "op").await.unwrap();
    }
    assert_eq!(members(&engine, "P1").await.len(), 5);

    let before = remote.commit_count();
    assert_eq!(engine.delete_bucket("P1", "op").await.unwrap(), 5);
    assert_eq!(remote.commit_count() - before, 3);
    assert!(engine.bucket("P1").await.unwrap().is_none());
    // One entry for the whole delete, counting every released member.
    let entry = latest_entry(&remote).await;
    assert_eq!(entry.action, ActivityAction::DeleteBucket);
    assert_eq!(entry.item_count, 5);
    assert_eq!(remote.count(collections::ACTIVITY_LOG), 5);
    assert_eq!(remote.count(collections::ITEMS), 5);
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn restore_is_refused_when_another_bucket_holds_the_item() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    pallet(&engine, "P2").await;
    engine.distribute("P1", &codes(&["A"]), "op").await.unwrap();
    engine.remove_item("P1", "A", "op").await.unwrap();
    engine.distribute("P2", &codes(&["A"]), "op").await.unwrap();

    let err = engine.restore_item("P1", "A", "op").await.unwrap_err();
    assert!(matches!(
        err,
        DistributionError::ItemAssignedElsewhere { ref bucket, .. } if bucket == "P2"
    ));

    // Removing from the wrong bucket leaves the claim alone.
    assert!(!engine.remove_item("P1", "A", "op").await.unwrap());
    assert_eq!(
        engine.item("A").await.unwrap().unwrap().bucket_id.as_deref(),
        Some("P2")
    );
    assert_consistent(&remote).await;
}

#[tokio::test]
async fn restore_undoes_remove() {
    let (remote, engine) = engine(30, 500);
    pallet(&engine, "P1").await;
    engine.distribute("P1", &codes(&["A", "B"]), "op").await.unwrap();

    assert!(engine.remove_item("P1", "A", "op").await.unwrap());
    assert!(!engine.remove_item("P1", "A", "op").await.unwrap());
    assert!(engine.restore_item("P1", "A", "op").await.unwrap());
    assert!(!engine.restore_item("P1", "A", "op").await.unwrap());

    assert_eq!(
        members(&engine, "P1").await,
        BTreeSet::from(["A".into(), "B".into()])
    );
    assert!(engine.item("A").await.unwrap().unwrap().belongs_to("P1"));
    assert_consistent(&remote).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distributions_assign_each_item_once() {
    let remote = Arc::new(MemoryRemoteStore::new(30, 500));
    let engine = Arc::new(DistributionEngine::new(remote.clone(), fast_retry(50)));
    pallet(&engine, "P1").await;
    pallet(&engine, "P2").await;

    let submissions = [
        ("P1", codes(&["A", "B", "C", "D"])),
        ("P2", codes(&["C", "D", "E", "F"])),
        ("P1", codes(&["E", "F", "G"])),
        ("P2", codes(&["A", "G", "H"])),
    ];
    let handles: Vec<_> = submissions
        .into_iter()
        .map(|(bucket, list)| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.distribute(bucket, &list, "op").await })
        })
        .collect();

    let mut added = 0;
    for h in handles {
        added += h.await.unwrap().unwrap().added_count;
    }
    assert_eq!(added, 8);
    let total = members(&engine, "P1").await.len() + members(&engine, "P2").await.len();
    assert_eq!(total, 8);
    assert_consistent(&remote).await;
}

async fn depot() -> (Arc<MemoryRemoteStore>, Depot) {
    let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    let remote = Arc::new(MemoryRemoteStore::default());
    let depot = Depot::with_parts(&cfg, PendingStore::new(pool), remote.clone());
    (remote, depot)
}

#[tokio::test]
async fn activity_is_recorded_newest_first() {
    let (_, depot) = depot().await;
    pallet(&depot.engine, "P1").await;
    depot
        .engine
        .distribute("P1", &codes(&["A", "B", "A"]), "alice")
        .await
        .unwrap();
    depot.engine.remove_item("P1", "B", "bob").await.unwrap();

    let recent = depot.activity.recent(10).await.unwrap();
    let actions: Vec<_> = recent.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            ActivityAction::RemoveItem,
            ActivityAction::Distribute,
            ActivityAction::CreateBucket
        ]
    );
    assert_eq!(recent[0].actor, "bob");
    assert_eq!(recent[1].item_count, 2);
    assert_eq!(recent[1].duplicate_count, 1);
    assert_eq!(recent[1].bucket_id.as_deref(), Some("P1"));

    assert_eq!(depot.activity.recent(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn only_admins_clear_activity() {
    let (remote, depot) = depot().await;
    pallet(&depot.engine, "P1").await;
    depot.engine.distribute("P1", &codes(&["A"]), "op").await.unwrap();

    assert!(matches!(
        depot.activity.clear("op").await,
        Err(ActivityError::Unauthorized(_))
    ));
    assert_eq!(remote.count(collections::ACTIVITY_LOG), 2);

    assert_eq!(
        depot.activity.clear("supervisor@depot.example").await.unwrap(),
        2
    );
    assert_eq!(remote.count(collections::ACTIVITY_LOG), 0);
    // Items and buckets are untouched.
    assert_eq!(members(&depot.engine, "P1").await.len(), 1);
}
