//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create records and wired-up stores with
//! sensible defaults.

use std::sync::Arc;

use quay_core::MemoryBackend;
use quay_store::{ObjectDocumentStore, Repository, SqliteStore, SyncEngine};
use serde_json::{json, Value};

use crate::stores::{RecordingDocumentStore, RecordingRelationalStore};

/// Both stores wrapped for recording, plus the engines built on them.
pub struct TestStores {
    /// Recording relational store over in-memory `SQLite`.
    pub relational: Arc<RecordingRelationalStore>,
    /// Recording document store over in-memory object storage.
    pub documents: Arc<RecordingDocumentStore>,
    /// Sync engine over the recording stores.
    pub sync: SyncEngine,
    /// CRUD repository over the recording stores.
    pub repository: Repository,
}

impl TestStores {
    /// Creates fresh in-memory stores.
    pub fn new() -> Self {
        let relational = Arc::new(RecordingRelationalStore::new(Arc::new(
            SqliteStore::open_in_memory().expect("in-memory sqlite"),
        )));
        let documents = Arc::new(RecordingDocumentStore::new(Arc::new(
            ObjectDocumentStore::new(Arc::new(MemoryBackend::new())),
        )));
        Self {
            sync: SyncEngine::new(relational.clone(), documents.clone()),
            repository: Repository::new(relational.clone(), documents.clone()),
            relational,
            documents,
        }
    }
}

impl Default for TestStores {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds `count` event records as an edge portal would send them.
pub fn event_records(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            json!({
                "id": format!("evt-{i:05}"),
                "userId": format!("u-{}", i % 7),
                "portalId": "gate-3",
                "vesselId": format!("v-{}", i % 3),
                "kind": if i % 2 == 0 { "entry" } else { "exit" },
                "occurredAt": format!("2024-05-01T{:02}:{:02}:00.000Z", (i / 60) % 24, i % 60),
            })
        })
        .collect()
}

/// A vessel record.
pub fn vessel(id: &str, name: &str, company_id: &str) -> Value {
    json!({"id": id, "name": name, "companyId": company_id})
}

/// A user record.
pub fn user(id: &str, name: &str, company_id: &str) -> Value {
    json!({"id": id, "name": name, "companyId": company_id})
}

/// An authorization for `user_id` on `vessel_id` between two RFC 3339 instants.
pub fn authorization(id: &str, user_id: &str, vessel_id: &str, from: &str, until: &str) -> Value {
    json!({
        "id": id,
        "userId": user_id,
        "vesselId": vessel_id,
        "validFrom": from,
        "validUntil": until,
    })
}
