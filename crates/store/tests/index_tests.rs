//! Identity resolution and parameter index integration tests.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use helios_index_store::config::SchemaType;
use helios_index_store::search::DEFAULT_TOKEN_SYSTEM;
use helios_index_store::{ResourceStorage, StoreConfig};

use common::{PatientFixture, TestStore, observation};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identity_resolution_converges() {
    let store = Arc::new(TestStore::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..50 {
                let ident = store
                    .backend
                    .resolve_identity("Patient", &format!("p{}", n))
                    .await
                    .unwrap();
                ids.push(ident.logical_resource_id);
            }
            ids
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    for ids in &results[1..] {
        assert_eq!(ids, &results[0]);
    }
    assert_eq!(results[0].iter().collect::<BTreeSet<_>>().len(), 50);
    assert_eq!(store.count("SELECT COUNT(*) FROM logical_resource_ident"), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_token_values_are_stored_once() {
    let store = Arc::new(TestStore::new());

    let mut handles = Vec::new();
    for n in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let patient = PatientFixture::new(format!("p{}", n), "Smith")
                .with_gender("female")
                .with_identifier("http://example.org/mrn", format!("MRN-{}", n));
            store
                .backend
                .upsert("Patient", &format!("p{}", n), patient.to_json())
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        store.count("SELECT COUNT(*) FROM common_token_values WHERE token_value = 'female'"),
        1
    );
    assert_eq!(
        store.count(&format!(
            "SELECT COUNT(*) FROM code_systems WHERE code_system_name = '{}'",
            DEFAULT_TOKEN_SYSTEM
        )),
        1
    );
    assert_eq!(
        store.count(
            "SELECT COUNT(*) FROM code_systems WHERE code_system_name = 'http://example.org/mrn'"
        ),
        1
    );
    assert_eq!(
        store.count("SELECT COUNT(*) FROM parameter_names WHERE parameter_name = 'gender'"),
        1
    );

    // Every patient points at the one shared gender token.
    assert_eq!(
        store.count(
            "SELECT COUNT(DISTINCT r.logical_resource_id)
               FROM patient_resource_token_refs r
               JOIN common_token_values t ON t.common_token_value_id = r.common_token_value_id
              WHERE t.token_value = 'female'"
        ),
        20
    );
}

#[tokio::test]
async fn test_updates_fully_replace_parameters() {
    let store = TestStore::new();

    let patient = PatientFixture::new("p1", "Smith")
        .with_gender("female")
        .with_identifier("http://example.org/mrn", "A1");
    store.backend.upsert("Patient", "p1", patient.to_json()).await.unwrap();

    let patient = PatientFixture::new("p1", "Jones").with_gender("male");
    store.backend.upsert("Patient", "p1", patient.to_json()).await.unwrap();

    let families: Vec<String> = store
        .inspect()
        .prepare("SELECT str_value FROM patient_str_values")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(families.iter().all(|f| f == "Jones"));

    let tokens: Vec<String> = store
        .inspect()
        .prepare(
            "SELECT t.token_value FROM patient_resource_token_refs r
               JOIN common_token_values t ON t.common_token_value_id = r.common_token_value_id
              ORDER BY t.token_value",
        )
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(tokens, vec!["male"]);
}

#[tokio::test]
async fn test_references_resolve_targets_before_they_exist() {
    let store = TestStore::new();

    store
        .backend
        .upsert("Observation", "o1", observation("o1", "8480-6", "Patient/later"))
        .await
        .unwrap();

    let target = store.backend.resolve_identity("Patient", "later").await.unwrap();
    let referenced: i64 = store
        .inspect()
        .query_row("SELECT ref_logical_resource_id FROM observation_ref_values", [], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(referenced, target.logical_resource_id);

    // Writing the target later reuses the identity the reference created.
    let written = store
        .backend
        .upsert("Patient", "later", PatientFixture::new("later", "Doe").to_json())
        .await
        .unwrap();
    assert_eq!(written.version.logical_resource_id(), target.logical_resource_id);
}

#[tokio::test]
async fn test_whole_system_tags() {
    let store = TestStore::new();
    let patient = PatientFixture::new("p1", "Smith").with_tag("http://example.org/tags", "vip");
    store.backend.upsert("Patient", "p1", patient.to_json()).await.unwrap();

    assert_eq!(store.count("SELECT COUNT(*) FROM patient_tags"), 1);
    assert_eq!(store.count("SELECT COUNT(*) FROM logical_resource_tags"), 1);
}

#[tokio::test]
async fn test_distributed_schema_shards_tokens() {
    let config = StoreConfig::default().with_schema_type(SchemaType::Distributed);
    let store = TestStore::with_config(config);

    store
        .backend
        .upsert("Patient", "p1", PatientFixture::new("p1", "A").with_gender("female").to_json())
        .await
        .unwrap();
    store
        .backend
        .upsert("Patient", "p2", PatientFixture::new("p2", "B").with_gender("female").to_json())
        .await
        .unwrap();

    let shards = store.count(
        "SELECT COUNT(DISTINCT shard_key) FROM logical_resources",
    );
    let tokens = store.count("SELECT COUNT(*) FROM common_token_values WHERE token_value = 'female'");
    // One token row per shard that uses it.
    assert_eq!(tokens, shards);
}
