//! End-to-end tests for the batched dual-store sync protocol.
//!
//! Stores are wrapped with the recording doubles from `quay-test-utils` so
//! transaction boundaries and mirror writes can be asserted directly.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::Result;
use quay_core::{EntityKind, MemoryBackend, RecordId};
use quay_store::{
    DocumentStore, ObjectDocumentStore, RelationalStore, SqliteStore, SyncEngine, SyncError,
    SyncLimits,
};
use quay_test_utils::{
    event_records, init_test_logging, RecordingDocumentStore, RecordingRelationalStore,
    TestStores, TracingMemoryBackend,
};
use serde_json::json;

#[tokio::test]
async fn large_event_sync_commits_in_fixed_size_transactions() -> Result<()> {
    init_test_logging();
    let stores = TestStores::new();

    let report = stores.sync.sync("Event", event_records(250)).await?;

    assert_eq!(stores.relational.committed_batches(), [100, 100, 50]);
    assert_eq!(stores.documents.merge_upserts(), 250);
    assert_eq!(report.received, 250);
    assert_eq!(report.batches.len(), 3);
    assert_eq!(report.mirrored, 250);
    assert_eq!(report.mirror_failures, 0);
    assert!(report.batches.iter().all(|b| b.write.inserted == b.records));

    assert_eq!(stores.relational.count(EntityKind::Event).await?, 250);
    assert_eq!(stores.documents.list_ids(EntityKind::Event).await?.len(), 250);
    Ok(())
}

#[tokio::test]
async fn unknown_entity_is_rejected_without_writes() -> Result<()> {
    let stores = TestStores::new();

    let err = stores
        .sync
        .sync("Spaceship", event_records(5))
        .await
        .expect_err("unknown entity");

    assert!(matches!(err, SyncError::UnknownEntity { ref name } if name == "Spaceship"));
    assert!(err.is_rejection());
    assert_eq!(stores.relational.write_count(), 0);
    assert_eq!(stores.documents.merge_upserts(), 0);
    Ok(())
}

#[tokio::test]
async fn non_syncable_entity_is_rejected_without_writes() -> Result<()> {
    let stores = TestStores::new();

    let err = stores
        .sync
        .sync("authorization", vec![json!({"id": "a-1"})])
        .await
        .expect_err("not syncable");

    assert!(matches!(
        err,
        SyncError::NotSyncable {
            entity: EntityKind::Authorization
        }
    ));
    assert_eq!(stores.relational.write_count(), 0);
    assert_eq!(stores.documents.merge_upserts(), 0);
    Ok(())
}

#[tokio::test]
async fn event_sync_over_cap_is_rejected_without_writes() -> Result<()> {
    let stores = TestStores::new();

    let err = stores
        .sync
        .sync_events(event_records(150))
        .await
        .expect_err("over cap");

    assert!(matches!(
        err,
        SyncError::TooManyRecords {
            count: 150,
            max: 100
        }
    ));
    assert_eq!(stores.relational.write_count(), 0);
    assert_eq!(stores.documents.merge_upserts(), 0);
    assert_eq!(stores.relational.count(EntityKind::Event).await?, 0);
    Ok(())
}

#[tokio::test]
async fn event_sync_at_cap_is_accepted() -> Result<()> {
    let stores = TestStores::new();

    let report = stores.sync.sync_events(event_records(100)).await?;

    assert_eq!(report.entity, EntityKind::Event);
    assert_eq!(stores.relational.committed_batches(), [100]);
    assert_eq!(stores.documents.merge_upserts(), 100);
    Ok(())
}

#[tokio::test]
async fn invalid_record_rejects_the_whole_request() -> Result<()> {
    let stores = TestStores::new();
    let mut records = event_records(120);
    records[110] = json!({"kind": "entry"});

    let err = stores
        .sync
        .sync("Event", records)
        .await
        .expect_err("invalid record");

    assert!(matches!(err, SyncError::InvalidRecord { index: 110, .. }));
    assert_eq!(stores.relational.write_count(), 0);
    assert_eq!(stores.documents.merge_upserts(), 0);
    Ok(())
}

#[tokio::test]
async fn resubmission_is_idempotent() -> Result<()> {
    let stores = TestStores::new();

    stores.sync.sync("Event", event_records(250)).await?;
    let first = stores.documents.get(EntityKind::Event, &RecordId::new("evt-00042")?).await?;

    let again = stores.sync.sync("Event", event_records(250)).await?;

    assert_eq!(stores.relational.count(EntityKind::Event).await?, 250);
    assert_eq!(stores.documents.list_ids(EntityKind::Event).await?.len(), 250);
    assert!(again
        .batches
        .iter()
        .all(|b| b.write.unchanged == b.records && b.write.inserted == 0));
    let second = stores.documents.get(EntityKind::Event, &RecordId::new("evt-00042")?).await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn resync_replaces_rows_and_merges_documents() -> Result<()> {
    let stores = TestStores::new();
    let id = RecordId::new("v-1")?;

    stores
        .sync
        .sync("Vessel", vec![json!({"id": "v-1", "name": "Nordlys", "flag": "NO"})])
        .await?;
    stores
        .sync
        .sync("Vessel", vec![json!({"id": "v-1", "name": "Nordlys II"})])
        .await?;

    let row = stores
        .relational
        .get(EntityKind::Vessel, &id)
        .await?
        .expect("row");
    assert_eq!(row.body.get("name"), Some(&json!("Nordlys II")));
    assert_eq!(row.body.get("flag"), None);

    let document = stores
        .documents
        .get(EntityKind::Vessel, &id)
        .await?
        .expect("document");
    assert_eq!(document.get("name"), Some(&json!("Nordlys II")));
    assert_eq!(document.get("flag"), Some(&json!("NO")));
    Ok(())
}

#[tokio::test]
async fn numeric_ids_are_normalized() -> Result<()> {
    let stores = TestStores::new();

    stores
        .sync
        .sync("company", vec![json!({"id": 42, "name": "Fjord Lines"})])
        .await?;

    let id = RecordId::new("42")?;
    let row = stores
        .relational
        .get(EntityKind::Company, &id)
        .await?
        .expect("row");
    assert_eq!(row.body.get("id"), Some(&json!("42")));
    assert!(stores.documents.get(EntityKind::Company, &id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn failed_batch_keeps_earlier_batches_committed() -> Result<()> {
    let stores = TestStores::new();
    stores.relational.fail_batch(1);

    let err = stores
        .sync
        .sync("Event", event_records(250))
        .await
        .expect_err("second batch fails");

    match err {
        SyncError::BatchFailed {
            entity,
            batch_index,
            batches,
            committed_batches,
            committed_records,
            ..
        } => {
            assert_eq!(entity, EntityKind::Event);
            assert_eq!(batch_index, 1);
            assert_eq!(batches, 3);
            assert_eq!(committed_batches, 1);
            assert_eq!(committed_records, 100);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(stores.relational.committed_batches(), [100]);
    assert_eq!(stores.relational.count(EntityKind::Event).await?, 100);
    assert_eq!(stores.documents.merge_upserts(), 100);

    // Resending the full set fills in the rest.
    let report = stores.sync.sync("Event", event_records(250)).await?;
    assert_eq!(report.batches[0].write.unchanged, 100);
    assert_eq!(stores.relational.count(EntityKind::Event).await?, 250);
    Ok(())
}

#[tokio::test]
async fn batch_aborted_partway_rolls_back_only_that_batch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("quay.db");
    let relational = Arc::new(SqliteStore::open(&path)?);
    // Third record of the second batch.
    rusqlite::Connection::open(&path)?.execute_batch(
        "CREATE TRIGGER reject_evt BEFORE INSERT ON events \
         WHEN NEW.id = 'evt-00102' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    )?;
    let documents = Arc::new(ObjectDocumentStore::new(Arc::new(MemoryBackend::new())));
    let engine = SyncEngine::new(relational.clone(), documents.clone());

    let err = engine
        .sync("Event", event_records(250))
        .await
        .expect_err("second batch aborts");

    assert!(matches!(
        err,
        SyncError::BatchFailed {
            batch_index: 1,
            committed_batches: 1,
            committed_records: 100,
            ..
        }
    ));
    assert_eq!(relational.count(EntityKind::Event).await?, 100);
    let missing = RecordId::new("evt-00101")?;
    assert!(relational.get(EntityKind::Event, &missing).await?.is_none());
    assert_eq!(documents.list_ids(EntityKind::Event).await?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn mirror_failures_do_not_fail_the_request() -> Result<()> {
    let stores = TestStores::new();
    stores.documents.fail_id("evt-00003");
    stores.documents.fail_id("evt-00150");

    let report = stores.sync.sync("Event", event_records(250)).await?;

    assert_eq!(report.mirrored, 248);
    assert_eq!(report.mirror_failures, 2);
    assert_eq!(report.batches[0].mirror_failures, 1);
    assert_eq!(report.batches[1].mirror_failures, 1);
    assert_eq!(report.batches[2].mirror_failures, 0);
    assert_eq!(stores.relational.count(EntityKind::Event).await?, 250);
    assert!(stores
        .documents
        .get(EntityKind::Event, &RecordId::new("evt-00003")?)
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn document_store_outage_still_commits_rows() -> Result<()> {
    let stores = TestStores::new();
    stores.documents.set_unavailable(true);

    let report = stores.sync.sync("User", vec![json!({"id": "u-1", "name": "Ada"})]).await?;

    assert_eq!(report.mirrored, 0);
    assert_eq!(report.mirror_failures, 1);
    assert_eq!(stores.relational.count(EntityKind::User).await?, 1);
    Ok(())
}

#[tokio::test]
async fn mirror_retries_lost_compare_and_swap() -> Result<()> {
    let backend = Arc::new(TracingMemoryBackend::new());
    let documents = Arc::new(RecordingDocumentStore::new(Arc::new(
        ObjectDocumentStore::new(backend.clone()),
    )));
    let relational = Arc::new(RecordingRelationalStore::new(Arc::new(
        SqliteStore::open_in_memory()?,
    )));
    let engine = SyncEngine::new(relational, documents.clone());

    backend.interfere_with_puts("documents/portals/", 2);
    let report = engine
        .sync("Portal", vec![json!({"id": "gate-3", "name": "Gate 3"})])
        .await?;

    assert_eq!(report.mirrored, 1);
    assert_eq!(backend.conditional_puts_under("documents/portals/"), 3);
    let document = documents
        .get(EntityKind::Portal, &RecordId::new("gate-3")?)
        .await?
        .expect("document");
    assert_eq!(document.get("name"), Some(&json!("Gate 3")));
    Ok(())
}

#[tokio::test]
async fn custom_batch_size_is_honoured() -> Result<()> {
    let relational = Arc::new(RecordingRelationalStore::new(Arc::new(
        SqliteStore::open_in_memory()?,
    )));
    let documents = Arc::new(ObjectDocumentStore::new(Arc::new(MemoryBackend::new())));
    let engine = SyncEngine::new(relational.clone(), documents).with_limits(SyncLimits {
        batch_size: 40,
        event_sync_max_records: 100,
    });

    engine.sync_events(event_records(100)).await?;

    assert_eq!(relational.committed_batches(), [40, 40, 20]);
    Ok(())
}
