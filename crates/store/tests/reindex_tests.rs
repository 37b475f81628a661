//! Reindex coordinator integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helios_index_store::ResourceStorage;
use helios_index_store::error::{StorageError, ValidationError};
use helios_index_store::search::{ReindexQueue, ReindexSweep};

use common::{PatientFixture, TestStore};

async fn seed(store: &TestStore, count: usize) {
    for n in 0..count {
        let patient = PatientFixture::new(format!("p{}", n), format!("Family{}", n % 7))
            .with_gender(if n % 2 == 0 { "female" } else { "male" });
        store
            .backend
            .upsert("Patient", &format!("p{}", n), patient.to_json())
            .await
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sweep_claims_each_resource_once() {
    let store = Arc::new(TestStore::new());
    seed(&store, 1000).await;
    tokio::time::sleep(Duration::from_millis(2)).await;

    let cutoff = Utc::now();
    let progress = ReindexSweep::new(cutoff)
        .with_workers(4)
        .run(store.backend.clone())
        .await
        .unwrap();
    assert_eq!(progress.claimed, 1000);
    assert_eq!(progress.unchanged, 1000);
    assert_eq!(progress.replaced, 0);
    assert_eq!(progress.failed, 0);
    assert!(progress.completed_at.is_some());

    assert_eq!(
        store.count("SELECT COUNT(*) FROM logical_resources WHERE reindex_txid <> 1"),
        0
    );

    // Same cutoff again: nothing is older than it any more.
    let again = ReindexSweep::new(cutoff)
        .with_workers(4)
        .run(store.backend.clone())
        .await
        .unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn test_forced_sweep_replaces_rows() {
    let store = TestStore::new();
    seed(&store, 10).await;
    let rows_before = store.count("SELECT COUNT(*) FROM patient_str_values");

    // Lose some rows behind the store's back.
    store
        .inspect()
        .execute("DELETE FROM patient_str_values", [])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2)).await;
    let progress = ReindexSweep::new(Utc::now())
        .with_force(true)
        .run(store.backend.clone())
        .await
        .unwrap();

    assert_eq!(progress.claimed, 10);
    assert_eq!(progress.replaced, 10);
    assert_eq!(store.count("SELECT COUNT(*) FROM patient_str_values"), rows_before);
}

#[tokio::test]
async fn test_future_cutoff_rejected() {
    let store = TestStore::new();
    let err = store
        .backend
        .reindex_next(Utc::now() + chrono::Duration::hours(1), false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Validation(ValidationError::InvalidCutoff { .. })
    ));
}

#[tokio::test]
async fn test_deleted_resources_are_not_claimed() {
    let store = TestStore::new();
    seed(&store, 3).await;
    store.backend.delete("Patient", "p1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;

    let cutoff = Utc::now();
    let mut claimed = Vec::new();
    while let Some(result) = store.backend.reindex_next(cutoff, false).await.unwrap() {
        claimed.push(result.claim.logical_id);
    }
    claimed.sort();
    assert_eq!(claimed, vec!["p0", "p2"]);
}
