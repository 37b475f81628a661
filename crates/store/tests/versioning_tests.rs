//! Version writer integration tests.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use helios_index_store::error::{ResourceError, StorageError};
use helios_index_store::{ResourceStorage, WriteDisposition, WriteRequest};
use serde_json::json;

use common::{PatientFixture, TestStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_get_distinct_versions() {
    let store = Arc::new(TestStore::new());

    let mut handles = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut versions = Vec::new();
            for round in 0..5 {
                let payload = PatientFixture::new("p1", format!("Writer{}Round{}", writer, round))
                    .to_json();
                let outcome = store.backend.upsert("Patient", "p1", payload).await.unwrap();
                versions.push(outcome.version.version_id());
            }
            versions
        }));
    }

    let mut seen = BTreeSet::new();
    for handle in handles {
        let versions = handle.await.unwrap();
        // Each writer observes its own versions strictly increasing.
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        for version in versions {
            assert!(seen.insert(version), "version {} issued twice", version);
        }
    }
    assert_eq!(seen, (1..=40).collect::<BTreeSet<i32>>());

    let current = store.backend.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(current.version_id(), 40);

    let history = store.backend.history("Patient", "p1", 0, 100).await.unwrap();
    let numbers: Vec<i32> = history.iter().map(|v| v.version_id()).collect();
    assert_eq!(numbers, (1..=40).collect::<Vec<_>>());

    assert_eq!(store.count("SELECT COUNT(*) FROM logical_resource_ident"), 1);
    assert_eq!(store.count("SELECT COUNT(*) FROM logical_resources"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_share_one_identity() {
    let store = Arc::new(TestStore::new());

    let mut handles = Vec::new();
    for writer in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let payload = PatientFixture::new("shared", format!("Writer{}", writer)).to_json();
            store.backend.upsert("Patient", "shared", payload).await.unwrap()
        }));
    }

    let mut created = 0;
    let mut ids = BTreeSet::new();
    let mut versions = BTreeSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.disposition == WriteDisposition::Created {
            created += 1;
        }
        ids.insert(outcome.version.logical_resource_id());
        versions.insert(outcome.version.version_id());
    }
    // Losers of the create race become later versions of the same resource.
    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
    assert_eq!(versions, (1..=6).collect::<BTreeSet<i32>>());
    assert_eq!(store.count("SELECT COUNT(*) FROM logical_resource_ident"), 1);
}

#[tokio::test]
async fn test_read_follows_latest_version() {
    let store = TestStore::new();

    store
        .backend
        .upsert("Patient", "abc", PatientFixture::new("abc", "First").to_json())
        .await
        .unwrap();
    let v1 = store.backend.read("Patient", "abc").await.unwrap().unwrap();
    assert_eq!(v1.version_id(), 1);

    store
        .backend
        .upsert("Patient", "abc", PatientFixture::new("abc", "Second").to_json())
        .await
        .unwrap();
    let v2 = store.backend.read("Patient", "abc").await.unwrap().unwrap();
    assert_eq!(v2.version_id(), 2);
    assert_eq!(v2.content()["name"][0]["family"], json!("Second"));

    let history = store.backend.history("Patient", "abc", 0, 10).await.unwrap();
    let numbers: Vec<i32> = history.iter().map(|v| v.version_id()).collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn test_explicit_version_replay_is_a_no_op() {
    let store = TestStore::new();
    let payload = PatientFixture::new("p1", "Smith").to_json();

    let first = store
        .backend
        .write(WriteRequest::upsert("Patient", "p1", payload.clone()).with_version(3))
        .await
        .unwrap();
    assert_eq!(first.disposition, WriteDisposition::Created);
    assert_eq!(first.version.version_id(), 3);
    let rows = store.count("SELECT COUNT(*) FROM patient_str_values");
    assert!(rows > 0);

    let replay = store
        .backend
        .write(WriteRequest::upsert("Patient", "p1", payload).with_version(3))
        .await
        .unwrap();
    assert_eq!(replay.disposition, WriteDisposition::Unchanged);
    assert_eq!(replay.version.resource_id(), first.version.resource_id());
    assert_eq!(store.count("SELECT COUNT(*) FROM resources"), 1);
    assert_eq!(store.count("SELECT COUNT(*) FROM patient_str_values"), rows);
}

#[tokio::test]
async fn test_older_explicit_version_is_history_only() {
    let store = TestStore::new();

    store
        .backend
        .write(
            WriteRequest::upsert("Patient", "p1", PatientFixture::new("p1", "Newer").to_json())
                .with_version(5),
        )
        .await
        .unwrap();
    let late = store
        .backend
        .write(
            WriteRequest::upsert("Patient", "p1", PatientFixture::new("p1", "Older").to_json())
                .with_version(4),
        )
        .await
        .unwrap();
    assert_eq!(late.disposition, WriteDisposition::HistoryOnly);

    let current = store.backend.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(current.version_id(), 5);
    assert_eq!(current.content()["name"][0]["family"], json!("Newer"));

    // Parameters still describe the current version.
    let families: i64 = store.count(
        "SELECT COUNT(*) FROM patient_str_values s
           JOIN parameter_names n ON n.parameter_name_id = s.parameter_name_id
          WHERE n.parameter_name = 'family' AND s.str_value = 'Older'",
    );
    assert_eq!(families, 0);

    let old = store.backend.vread("Patient", "p1", 4).await.unwrap();
    assert_eq!(old.content()["name"][0]["family"], json!("Older"));
}

#[tokio::test]
async fn test_delete_and_resurrect() {
    let store = TestStore::new();
    let payload = PatientFixture::new("p1", "Smith").to_json();

    store.backend.upsert("Patient", "p1", payload.clone()).await.unwrap();
    let deleted = store.backend.delete("Patient", "p1").await.unwrap();
    assert_eq!(deleted.version.version_id(), 2);
    assert!(deleted.version.is_deleted());
    assert_eq!(store.count("SELECT COUNT(*) FROM patient_str_values"), 0);

    let err = store.backend.read("Patient", "p1").await.unwrap_err();
    assert!(matches!(err, StorageError::Resource(ResourceError::Gone { .. })));

    let again = store.backend.delete("Patient", "p1").await.unwrap();
    assert_eq!(again.disposition, WriteDisposition::Unchanged);

    let back = store.backend.upsert("Patient", "p1", payload).await.unwrap();
    assert_eq!(back.disposition, WriteDisposition::Updated);
    assert_eq!(back.version.version_id(), 3);
    assert!(store.count("SELECT COUNT(*) FROM patient_str_values") > 0);
}

#[tokio::test]
async fn test_delete_unknown_resource() {
    let store = TestStore::new();
    let err = store.backend.delete("Patient", "ghost").await.unwrap_err();
    assert!(matches!(err, StorageError::Resource(ResourceError::NotFound { .. })));
}
