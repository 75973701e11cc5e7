//! Store wrappers that record calls and inject failures.
//!
//! [`RecordingRelationalStore`] counts relational transactions and can roll
//! back a chosen batch; [`RecordingDocumentStore`] counts merge-upserts and
//! can fail them. Both delegate to a real store otherwise.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quay_core::{EntityKind, Fields, Record, RecordId};
use quay_store::{
    BatchWrite, Dashboard, DashboardWindow, DocumentStore, ListQuery, MergeOutcome, Page,
    RelationalStore, Result, StoreError, StoredRecord,
};

/// A relational store call, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationalOp {
    /// `upsert_batch` with the number of records in the batch.
    UpsertBatch {
        /// Entity kind.
        kind: EntityKind,
        /// Records in the batch.
        records: usize,
        /// Whether the transaction committed.
        committed: bool,
    },
    /// `insert`.
    Insert {
        /// Entity kind.
        kind: EntityKind,
    },
    /// `update`.
    Update {
        /// Entity kind.
        kind: EntityKind,
    },
    /// `delete`.
    Delete {
        /// Entity kind.
        kind: EntityKind,
    },
}

/// Relational store wrapper with transaction recording.
#[derive(Clone)]
pub struct RecordingRelationalStore {
    inner: Arc<dyn RelationalStore>,
    ops: Arc<Mutex<Vec<RelationalOp>>>,
    fail_batches: Arc<Mutex<HashSet<usize>>>,
    batch_calls: Arc<Mutex<usize>>,
}

impl RecordingRelationalStore {
    /// Wraps a store.
    pub fn new(inner: Arc<dyn RelationalStore>) -> Self {
        Self {
            inner,
            ops: Arc::default(),
            fail_batches: Arc::default(),
            batch_calls: Arc::default(),
        }
    }

    /// Makes the `n`th `upsert_batch` call (zero-based, counted across
    /// requests) fail without writing.
    pub fn fail_batch(&self, n: usize) {
        self.fail_batches.lock().expect("lock").insert(n);
    }

    /// Returns all recorded writes.
    pub fn ops(&self) -> Vec<RelationalOp> {
        self.ops.lock().expect("lock").clone()
    }

    /// Returns the sizes of committed batch transactions, in order.
    pub fn committed_batches(&self) -> Vec<usize> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                RelationalOp::UpsertBatch {
                    records,
                    committed: true,
                    ..
                } => Some(records),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of write calls of any kind.
    pub fn write_count(&self) -> usize {
        self.ops().len()
    }

    fn record(&self, op: RelationalOp) {
        self.ops.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl RelationalStore for RecordingRelationalStore {
    async fn insert(&self, kind: EntityKind, record: Record) -> Result<StoredRecord> {
        self.record(RelationalOp::Insert { kind });
        self.inner.insert(kind, record).await
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<StoredRecord>> {
        self.inner.get(kind, id).await
    }

    async fn list(&self, kind: EntityKind, query: &ListQuery) -> Result<Page> {
        self.inner.list(kind, query).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &RecordId,
        patch: Fields,
    ) -> Result<StoredRecord> {
        self.record(RelationalOp::Update { kind });
        self.inner.update(kind, id, patch).await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        self.record(RelationalOp::Delete { kind });
        self.inner.delete(kind, id).await
    }

    async fn upsert_batch(&self, kind: EntityKind, records: &[Record]) -> Result<BatchWrite> {
        let call = {
            let mut calls = self.batch_calls.lock().expect("lock");
            let call = *calls;
            *calls += 1;
            call
        };
        let fail = self.fail_batches.lock().expect("lock").contains(&call);
        if fail {
            self.record(RelationalOp::UpsertBatch {
                kind,
                records: records.len(),
                committed: false,
            });
            return Err(StoreError::Database {
                message: format!("injected failure for batch call {call}"),
                source: None,
            });
        }

        let result = self.inner.upsert_batch(kind, records).await;
        self.record(RelationalOp::UpsertBatch {
            kind,
            records: records.len(),
            committed: result.is_ok(),
        });
        result
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        self.inner.count(kind).await
    }

    async fn dashboard(&self, window: &DashboardWindow) -> Result<Dashboard> {
        self.inner.dashboard(window).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

/// A document store write, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOp {
    /// `merge_upsert`.
    MergeUpsert {
        /// Entity kind.
        kind: EntityKind,
        /// Document id.
        id: String,
        /// Whether the write succeeded.
        ok: bool,
    },
    /// `delete`.
    Delete {
        /// Entity kind.
        kind: EntityKind,
        /// Document id.
        id: String,
    },
}

/// Document store wrapper with write recording.
#[derive(Clone)]
pub struct RecordingDocumentStore {
    inner: Arc<dyn DocumentStore>,
    ops: Arc<Mutex<Vec<DocumentOp>>>,
    fail_ids: Arc<Mutex<HashSet<String>>>,
    fail_all: Arc<Mutex<bool>>,
}

impl RecordingDocumentStore {
    /// Wraps a store.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            ops: Arc::default(),
            fail_ids: Arc::default(),
            fail_all: Arc::default(),
        }
    }

    /// Makes merge-upserts of the given id fail.
    pub fn fail_id(&self, id: impl Into<String>) {
        self.fail_ids.lock().expect("lock").insert(id.into());
    }

    /// Makes every write fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.fail_all.lock().expect("lock") = unavailable;
    }

    /// Returns all recorded writes.
    pub fn ops(&self) -> Vec<DocumentOp> {
        self.ops.lock().expect("lock").clone()
    }

    /// Returns the number of merge-upsert attempts.
    pub fn merge_upserts(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, DocumentOp::MergeUpsert { .. }))
            .count()
    }

    fn should_fail(&self, id: &RecordId) -> bool {
        *self.fail_all.lock().expect("lock")
            || self.fail_ids.lock().expect("lock").contains(id.as_str())
    }

    fn unavailable() -> StoreError {
        StoreError::Backend(quay_core::Error::storage("injected document store outage"))
    }
}

#[async_trait]
impl DocumentStore for RecordingDocumentStore {
    async fn merge_upsert(
        &self,
        kind: EntityKind,
        id: &RecordId,
        fields: &Fields,
    ) -> Result<MergeOutcome> {
        let result = if self.should_fail(id) {
            Err(Self::unavailable())
        } else {
            self.inner.merge_upsert(kind, id, fields).await
        };
        self.ops.lock().expect("lock").push(DocumentOp::MergeUpsert {
            kind,
            id: id.to_string(),
            ok: result.is_ok(),
        });
        result
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Fields>> {
        self.inner.get(kind, id).await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        self.ops.lock().expect("lock").push(DocumentOp::Delete {
            kind,
            id: id.to_string(),
        });
        if self.should_fail(id) {
            return Err(Self::unavailable());
        }
        self.inner.delete(kind, id).await
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        self.inner.list_ids(kind).await
    }

    async fn ping(&self) -> Result<()> {
        if *self.fail_all.lock().expect("lock") {
            return Err(Self::unavailable());
        }
        self.inner.ping().await
    }
}
