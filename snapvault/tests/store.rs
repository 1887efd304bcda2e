//! Integration tests for the snapshot store: commit protocol, caching,
//! request coalescing, and the closing-period update decision.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use pretty_assertions::assert_eq;

use snapvault::{
    DistrictRecord, Error, RecordStatus, Snapshot, SnapshotStatus, SnapshotStore, StoreConfig,
    UpdateReason, WriteOptions,
};

fn record(district_id: &str) -> DistrictRecord {
    DistrictRecord {
        district_id: district_id.to_string(),
        district_name: format!("District {district_id}"),
        collected_at: Utc::now(),
        status: RecordStatus::Success,
        error: None,
        stats: serde_json::json!({ "members": 120, "score": 87.5 }),
    }
}

fn snapshot(snapshot_id: &str, districts: &[&str]) -> Snapshot {
    Snapshot {
        snapshot_id: snapshot_id.to_string(),
        schema_version: Some("3".to_string()),
        calculation_version: None,
        ranking_version: None,
        status: SnapshotStatus::Success,
        errors: Vec::new(),
        district_errors: Vec::new(),
        districts: districts.iter().map(|id| record(id)).collect(),
        source_system: Some("perf-portal".to_string()),
        as_of_date: snapshot_id.parse().ok(),
        is_closing_period_data: false,
        collection_date: snapshot_id.parse().ok(),
        logical_date: None,
    }
}

async fn open_store(root: &Path) -> SnapshotStore {
    SnapshotStore::open(StoreConfig {
        root: root.to_path_buf(),
        ..StoreConfig::default()
    })
    .await
    .expect("store should open")
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

// -- Tests ---------------------------------------------------------------

#[tokio::test]
async fn empty_store_has_no_latest_successful() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    assert!(store.latest_successful().await.unwrap().is_none());
    assert!(store.list_snapshot_ids().await.unwrap().is_empty());
    assert!(store.get_snapshot("2024-01-01").await.unwrap().is_none());
}

#[tokio::test]
async fn lifecycle_latest_skips_non_success_and_delete_empties() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    store
        .write_snapshot(&snapshot("2024-01-01", &["d1", "d2"]), None, &WriteOptions::default())
        .await
        .unwrap();
    let latest = store.latest_successful().await.unwrap().unwrap();
    assert_eq!(latest.metadata.snapshot_id, "2024-01-01");
    assert_eq!(latest.districts.len(), 2);

    let mut rejected = snapshot("2024-01-02", &["d1", "d2"]);
    rejected.status = SnapshotStatus::Failed;
    rejected.errors.push("validation rejected the extract".to_string());
    store
        .write_snapshot(&rejected, None, &WriteOptions::default())
        .await
        .unwrap();

    // A cold-cached instance must also skip the failed snapshot.
    let cold = open_store(dir.path()).await;
    let latest = cold.latest_successful().await.unwrap().unwrap();
    assert_eq!(latest.metadata.snapshot_id, "2024-01-01");

    // The failed snapshot is still committed and auditable.
    let failed = store.get_snapshot("2024-01-02").await.unwrap().unwrap();
    assert_eq!(failed.metadata.status, SnapshotStatus::Failed);
    assert_eq!(failed.metadata.errors.len(), 1);

    assert!(store.delete_snapshot("2024-01-01").await.unwrap());
    assert!(store.latest_successful().await.unwrap().is_none());
    assert_eq!(
        store.list_snapshot_ids().await.unwrap(),
        vec!["2024-01-02".to_string()]
    );
    assert!(!store.delete_snapshot("2024-01-01").await.unwrap());
}

#[tokio::test]
async fn interrupted_write_without_metadata_is_invisible() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    // Simulate a writer dying after district files and manifest landed
    // but before the metadata commit marker.
    let partial_dir = dir.path().join("2024-02-01");
    std::fs::create_dir_all(&partial_dir).unwrap();
    std::fs::write(
        partial_dir.join("district_d1.json"),
        serde_json::to_vec_pretty(&record("d1")).unwrap(),
    )
    .unwrap();
    std::fs::write(
        partial_dir.join("manifest.json"),
        serde_json::json!({
            "snapshot_id": "2024-02-01",
            "generated_at": Utc::now(),
            "districts": {},
            "rankings": { "present": false, "size_bytes": 0 }
        })
        .to_string(),
    )
    .unwrap();

    assert!(store.latest_successful().await.unwrap().is_none());
    assert!(store.get_snapshot("2024-02-01").await.unwrap().is_none());
    assert!(store.list_snapshots(None, None).await.unwrap().is_empty());
    assert!(store.list_snapshot_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_latest_reads_collapse_to_one_scan() {
    let dir = tempfile::tempdir().unwrap();
    {
        let seed = open_store(dir.path()).await;
        seed.write_snapshot(&snapshot("2024-02-10", &["d1"]), None, &WriteOptions::default())
            .await
            .unwrap();
    }

    // Fresh instance: caches are cold, so every caller misses and all
    // but the leader attach to the in-flight scan.
    let store = open_store(dir.path()).await;
    let (a, b, c, d, e, f, g, h) = tokio::join!(
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
        store.latest_successful(),
    );

    let results: Vec<Arc<_>> = [a, b, c, d, e, f, g, h]
        .into_iter()
        .map(|r| r.unwrap().expect("snapshot should be found"))
        .collect();
    for other in &results[1..] {
        assert!(
            Arc::ptr_eq(&results[0], other),
            "all callers observe the same value"
        );
    }

    let metrics = store.performance_metrics();
    assert_eq!(metrics.total_reads, 8);
    assert_eq!(metrics.cache_misses, 8);
    assert_eq!(metrics.coalesced_reads, 7, "one scan, seven followers");
    assert_eq!(metrics.cache_hits, 0);
    assert_eq!(metrics.max_concurrent_reads, 8);

    // Now warm: a ninth read is a cache hit.
    let again = store.latest_successful().await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&results[0], &again));
    assert_eq!(store.performance_metrics().cache_hits, 1);

    store.reset_performance_metrics();
    assert_eq!(store.performance_metrics().total_reads, 0);
}

#[tokio::test]
async fn cached_read_goes_stale_only_until_ttl_against_external_writer() {
    let dir = tempfile::tempdir().unwrap();
    let reader_side = SnapshotStore::open(StoreConfig {
        root: dir.path().to_path_buf(),
        current_ttl: Duration::from_millis(150),
        ..StoreConfig::default()
    })
    .await
    .unwrap();
    let writer_side = open_store(dir.path()).await;

    writer_side
        .write_snapshot(&snapshot("2024-03-01", &["d1"]), None, &WriteOptions::default())
        .await
        .unwrap();
    let first = reader_side.latest_successful().await.unwrap().unwrap();
    assert_eq!(first.metadata.snapshot_id, "2024-03-01");

    // A write by another process does not invalidate this instance's
    // cache; the stale value is served until the TTL elapses.
    writer_side
        .write_snapshot(&snapshot("2024-03-02", &["d1"]), None, &WriteOptions::default())
        .await
        .unwrap();
    let stale = reader_side.latest_successful().await.unwrap().unwrap();
    assert_eq!(stale.metadata.snapshot_id, "2024-03-01");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let fresh = reader_side.latest_successful().await.unwrap().unwrap();
    assert_eq!(fresh.metadata.snapshot_id, "2024-03-02");
}

#[tokio::test]
async fn own_writes_invalidate_caches_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    store
        .write_snapshot(&snapshot("2024-03-10", &["d1"]), None, &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        store
            .latest_successful()
            .await
            .unwrap()
            .unwrap()
            .metadata
            .snapshot_id,
        "2024-03-10"
    );
    assert_eq!(store.list_snapshots(None, None).await.unwrap().len(), 1);

    store
        .write_snapshot(&snapshot("2024-03-11", &["d1"]), None, &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        store
            .latest_successful()
            .await
            .unwrap()
            .unwrap()
            .metadata
            .snapshot_id,
        "2024-03-11"
    );
    assert_eq!(store.list_snapshots(None, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn writing_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let snap = snapshot("2024-04-01", &["d1", "d2", "d3"]);

    let first = store
        .write_snapshot(&snap, None, &WriteOptions::default())
        .await
        .unwrap();
    let second = store
        .write_snapshot(&snap, None, &WriteOptions::default())
        .await
        .unwrap();

    assert_eq!(first.metadata.status, second.metadata.status);
    assert_eq!(first.metadata.district_count, second.metadata.district_count);
    assert_eq!(first.metadata.success_count, second.metadata.success_count);
    assert_eq!(
        first.manifest.districts.keys().collect::<Vec<_>>(),
        second.manifest.districts.keys().collect::<Vec<_>>()
    );
    for (district_id, entry) in &first.manifest.districts {
        let twin = &second.manifest.districts[district_id];
        assert_eq!(entry.file, twin.file);
        assert_eq!(entry.status, twin.status);
        assert_eq!(entry.size_bytes, twin.size_bytes);
    }

    let mut files: Vec<String> = std::fs::read_dir(dir.path().join("2024-04-01"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            "district_d1.json",
            "district_d2.json",
            "district_d3.json",
            "manifest.json",
            "metadata.json"
        ]
    );
}

#[tokio::test]
async fn one_failing_district_does_not_abort_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    // Occupy d3's record path with a directory so its write fails.
    let snap_dir = dir.path().join("2024-04-15");
    std::fs::create_dir_all(snap_dir.join("district_d3.json")).unwrap();

    let outcome = store
        .write_snapshot(
            &snapshot("2024-04-15", &["d1", "d2", "d3", "d4", "d5"]),
            None,
            &WriteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.metadata.status, SnapshotStatus::Partial);
    assert_eq!(outcome.metadata.district_count, 5);
    assert_eq!(outcome.metadata.success_count, 4);
    assert_eq!(outcome.failed_districts, vec!["d3".to_string()]);
    assert_eq!(outcome.manifest.success_count(), 4);
    assert_eq!(outcome.manifest.failure_count(), 1);
    assert_eq!(
        outcome.manifest.districts["d3"].status,
        RecordStatus::Failed
    );
    assert!(
        outcome
            .metadata
            .district_errors
            .iter()
            .any(|e| e.district_id == "d3" && e.operation == "write_record")
    );

    // Clear the obstruction; the failed district reads as not-found while
    // the successful four read back intact.
    std::fs::remove_dir_all(snap_dir.join("district_d3.json")).unwrap();
    for ok in ["d1", "d2", "d4", "d5"] {
        assert!(
            store
                .district_record("2024-04-15", ok)
                .await
                .unwrap()
                .is_some(),
            "district {ok} should read back"
        );
    }
    assert!(
        store
            .district_record("2024-04-15", "d3")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn should_update_follows_collection_date_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let decision = store
        .should_update("2024-05-01", date("2024-05-01"))
        .await
        .unwrap();
    assert!(decision.should_update);
    assert_eq!(decision.reason, UpdateReason::NoExisting);

    let mut snap = snapshot("2024-05-01", &["d1"]);
    snap.is_closing_period_data = true;
    snap.collection_date = Some(date("2024-05-02"));
    store
        .write_snapshot(&snap, None, &WriteOptions::default())
        .await
        .unwrap();

    let stale = store
        .should_update("2024-05-01", date("2024-05-01"))
        .await
        .unwrap();
    assert!(!stale.should_update);
    assert_eq!(stale.reason, UpdateReason::ExistingIsNewer);

    let same = store
        .should_update("2024-05-01", date("2024-05-02"))
        .await
        .unwrap();
    assert!(same.should_update);
    assert_eq!(same.reason, UpdateReason::SameDayRefresh);

    let newer = store
        .should_update("2024-05-01", date("2024-05-03"))
        .await
        .unwrap();
    assert!(newer.should_update);
    assert_eq!(newer.reason, UpdateReason::NewerData);

    // Unreadable metadata fails open so ingestion is never blocked.
    std::fs::write(dir.path().join("2024-05-01/metadata.json"), "{ not json").unwrap();
    let fail_open = store
        .should_update("2024-05-01", date("2024-05-01"))
        .await
        .unwrap();
    assert!(fail_open.should_update);
    assert_eq!(fail_open.reason, UpdateReason::NoExisting);
}

#[tokio::test]
async fn override_date_stores_under_the_logical_date() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let mut snap = snapshot("2024-06-02", &["d1"]);
    snap.is_closing_period_data = true;
    snap.logical_date = Some(date("2024-06-01"));
    let outcome = store
        .write_snapshot(
            &snap,
            None,
            &WriteOptions {
                override_date: Some("2024-06-01".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.metadata.snapshot_id, "2024-06-01");

    let stored = store.get_snapshot("2024-06-01").await.unwrap().unwrap();
    assert_eq!(stored.metadata.collection_date, Some(date("2024-06-02")));
    assert_eq!(stored.metadata.logical_date, Some(date("2024-06-01")));
    assert!(store.get_snapshot("2024-06-02").await.unwrap().is_none());
}

#[tokio::test]
async fn rankings_artifact_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    let table = serde_json::json!({
        "rankings": [
            { "district_id": "d2", "rank": 1 },
            { "district_id": "d1", "rank": 2 },
        ]
    });
    store
        .write_snapshot(
            &snapshot("2024-07-01", &["d1", "d2"]),
            Some(&table),
            &WriteOptions::default(),
        )
        .await
        .unwrap();
    store
        .write_snapshot(&snapshot("2024-07-02", &["d1"]), None, &WriteOptions::default())
        .await
        .unwrap();

    assert!(store.has_rankings("2024-07-01").await.unwrap());
    assert_eq!(store.rankings("2024-07-01").await.unwrap().unwrap(), table);
    let manifest = store.manifest("2024-07-01").await.unwrap().unwrap();
    assert!(manifest.rankings.present);
    assert!(manifest.rankings.size_bytes > 0);

    assert!(!store.has_rankings("2024-07-02").await.unwrap());
    assert!(store.rankings("2024-07-02").await.unwrap().is_none());
}

#[tokio::test]
async fn listing_filters_and_batch_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    store
        .write_snapshot(&snapshot("2024-08-01", &["d1", "d2"]), None, &WriteOptions::default())
        .await
        .unwrap();
    let mut failed = snapshot("2024-08-02", &["d1"]);
    failed.status = SnapshotStatus::Failed;
    store
        .write_snapshot(&failed, None, &WriteOptions::default())
        .await
        .unwrap();

    let all = store.list_snapshots(None, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].snapshot_id, "2024-08-02", "newest first");

    let successes = store
        .list_snapshots(
            None,
            Some(&snapvault::SnapshotFilter {
                status: Some(SnapshotStatus::Success),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].snapshot_id, "2024-08-01");

    let big_enough = store
        .list_snapshots(
            None,
            Some(&snapvault::SnapshotFilter {
                min_district_count: Some(2),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(big_enough.len(), 1);

    let limited = store.list_snapshots(Some(1), None).await.unwrap();
    assert_eq!(limited.len(), 1);

    // Batch lookup with a warm listing cache: the unknown id is answered
    // without a filesystem probe.
    let batch = store
        .metadata_batch(&["2024-08-01".to_string(), "2099-01-01".to_string()])
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch[0].1.is_some());
    assert!(batch[1].1.is_none());
}

#[tokio::test]
async fn streamed_district_records_become_visible_at_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    store
        .write_district_record("2024-09-01", &record("d1"))
        .await
        .unwrap();

    // The record file is readable directly, but the snapshot has no
    // commit marker yet.
    assert!(
        store
            .district_record("2024-09-01", "d1")
            .await
            .unwrap()
            .is_some()
    );
    assert!(store.get_snapshot("2024-09-01").await.unwrap().is_none());

    store
        .write_snapshot(&snapshot("2024-09-01", &["d1", "d2"]), None, &WriteOptions::default())
        .await
        .unwrap();
    let stored = store.get_snapshot("2024-09-01").await.unwrap().unwrap();
    assert_eq!(stored.districts.len(), 2);
}

#[tokio::test]
async fn invalid_identifiers_are_rejected_before_io() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;

    assert!(matches!(
        store.get_snapshot("../etc").await,
        Err(Error::InvalidIdentifier(_))
    ));
    assert!(matches!(
        store.should_update("2024/01/01", date("2024-01-01")).await,
        Err(Error::InvalidIdentifier(_))
    ));
    assert!(matches!(
        store.district_record("2024-01-01", "d 1").await,
        Err(Error::InvalidIdentifier(_))
    ));

    let mut bad = snapshot("2024-10-01", &["d1"]);
    bad.snapshot_id = "..".to_string();
    assert!(matches!(
        store.write_snapshot(&bad, None, &WriteOptions::default()).await,
        Err(Error::InvalidIdentifier(_))
    ));
}
