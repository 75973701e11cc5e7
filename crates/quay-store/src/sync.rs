//! Batched dual-store synchronization.
//!
//! Edge devices (portals, beacon readers) push whole record sets without
//! knowing which records already exist. The engine:
//!
//! 1. resolves the entity name against the syncable kinds,
//! 2. validates every record (object with an `id`) before touching storage,
//! 3. splits the records into fixed-size batches, each upserted into the
//!    relational store inside its own transaction,
//! 4. after each batch commits, merge-upserts every record of the batch into
//!    the document store.
//!
//! A failing batch stops the request. Batches committed before it stay
//! committed; the error reports how far the request got. Mirror writes are
//! best-effort: failures are counted and logged, never surfaced as errors.
//! Because both writes are keyed by record id, re-sending the same records
//! converges both stores.

use std::sync::Arc;
use std::time::Instant;

use quay_core::{EntityKind, Record};
use serde::Serialize;
use serde_json::Value;

use crate::document::{DocumentStore, MergeOutcome};
use crate::error::StoreError;
use crate::metrics::{
    record_batch_committed, record_batch_failed, record_mirror_failure, record_mirror_write,
    record_sync_rejected,
};
use crate::relational::{BatchWrite, RelationalStore};

/// Records per relational transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Maximum records accepted by one event-sync request.
pub const DEFAULT_EVENT_SYNC_MAX_RECORDS: usize = 100;

/// Batch size and request caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    /// Records per relational transaction.
    pub batch_size: usize,
    /// Maximum records per event-sync request.
    pub event_sync_max_records: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            event_sync_max_records: DEFAULT_EVENT_SYNC_MAX_RECORDS,
        }
    }
}

/// Outcome of one committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Zero-based batch position.
    pub index: usize,
    /// Records in the batch.
    pub records: usize,
    /// Relational write counts.
    #[serde(flatten)]
    pub write: BatchWrite,
    /// Documents created or merged.
    pub mirrored: usize,
    /// Document writes that failed.
    pub mirror_failures: usize,
}

/// Outcome of a successful sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Entity kind that was synchronized.
    pub entity: EntityKind,
    /// Records received.
    pub received: usize,
    /// Per-batch outcomes, in order.
    pub batches: Vec<BatchReport>,
    /// Documents created, merged or already up to date.
    pub mirrored: usize,
    /// Document writes that failed.
    pub mirror_failures: usize,
}

/// Errors returned by a sync request.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The entity name is not in the catalogue.
    #[error("unknown entity '{name}'")]
    UnknownEntity {
        /// The name that was sent.
        name: String,
    },

    /// The entity exists but edge devices may not push it.
    #[error("entity {entity} cannot be synchronized")]
    NotSyncable {
        /// The resolved kind.
        entity: EntityKind,
    },

    /// A record failed validation.
    #[error("record {index} is invalid: {message}")]
    InvalidRecord {
        /// Zero-based position in the request.
        index: usize,
        /// What was wrong.
        message: String,
    },

    /// The request carries more records than allowed.
    #[error("{count} records exceed the limit of {max} per request")]
    TooManyRecords {
        /// Records sent.
        count: usize,
        /// Records allowed.
        max: usize,
    },

    /// A batch transaction failed; earlier batches remain committed.
    #[error(
        "batch {batch_index} of {batches} failed with {committed_records} records already committed: {source}"
    )]
    BatchFailed {
        /// Entity kind being synchronized.
        entity: EntityKind,
        /// Zero-based index of the failing batch.
        batch_index: usize,
        /// Total batches in the request.
        batches: usize,
        /// Batches committed before the failure.
        committed_batches: usize,
        /// Records committed before the failure.
        committed_records: usize,
        /// The store error that aborted the batch.
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    /// Returns true if nothing was written because the request was rejected.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        !matches!(self, Self::BatchFailed { .. })
    }

    const fn reason(&self) -> &'static str {
        match self {
            Self::UnknownEntity { .. } => "unknown_entity",
            Self::NotSyncable { .. } => "not_syncable",
            Self::InvalidRecord { .. } => "invalid_record",
            Self::TooManyRecords { .. } => "too_many_records",
            Self::BatchFailed { .. } => "batch_failed",
        }
    }
}

/// Applies sync requests to both stores.
#[derive(Clone)]
pub struct SyncEngine {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
    limits: SyncLimits,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine with default limits.
    #[must_use]
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
            limits: SyncLimits::default(),
        }
    }

    /// Overrides the batch size and caps.
    #[must_use]
    pub const fn with_limits(mut self, limits: SyncLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn limits(&self) -> SyncLimits {
        self.limits
    }

    /// Resolves an entity name to a syncable kind.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEntity` or `NotSyncable`.
    pub fn resolve_entity(name: &str) -> Result<EntityKind, SyncError> {
        let kind = EntityKind::from_name(name).ok_or_else(|| SyncError::UnknownEntity {
            name: name.to_string(),
        })?;
        if !kind.is_syncable() {
            return Err(SyncError::NotSyncable { entity: kind });
        }
        Ok(kind)
    }

    /// Validates every record of a request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` for the first record that is not an object with a valid `id`.
    pub fn prepare_records(records: Vec<Value>) -> Result<Vec<Record>, SyncError> {
        records
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                Record::from_value(value).map_err(|e| SyncError::InvalidRecord {
                    index,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    /// Synchronizes records of the named entity.
    ///
    /// # Errors
    ///
    /// Rejections (unknown entity, invalid record) happen before any write.
    /// `BatchFailed` reports a relational failure after zero or more committed batches.
    pub async fn sync(&self, entity: &str, records: Vec<Value>) -> Result<SyncReport, SyncError> {
        let prepared = Self::resolve_entity(entity)
            .and_then(|kind| Self::prepare_records(records).map(|records| (kind, records)));
        match prepared {
            Ok((kind, records)) => self.apply(kind, records).await,
            Err(err) => Err(Self::rejected(err)),
        }
    }

    /// Synchronizes events through the capped event-sync path.
    ///
    /// # Errors
    ///
    /// Returns `TooManyRecords` without writing if the cap is exceeded,
    /// otherwise behaves like [`SyncEngine::sync`] for `Event`.
    pub async fn sync_events(&self, records: Vec<Value>) -> Result<SyncReport, SyncError> {
        let max = self.limits.event_sync_max_records;
        if records.len() > max {
            return Err(Self::rejected(SyncError::TooManyRecords {
                count: records.len(),
                max,
            }));
        }
        match Self::prepare_records(records) {
            Ok(records) => self.apply(EntityKind::Event, records).await,
            Err(err) => Err(Self::rejected(err)),
        }
    }

    fn rejected(err: SyncError) -> SyncError {
        record_sync_rejected(err.reason());
        tracing::warn!(error = %err, "sync request rejected");
        err
    }

    async fn apply(&self, kind: EntityKind, records: Vec<Record>) -> Result<SyncReport, SyncError> {
        let batch_size = self.limits.batch_size.max(1);
        let batches = records.len().div_ceil(batch_size);
        let mut report = SyncReport {
            entity: kind,
            received: records.len(),
            batches: Vec::with_capacity(batches),
            mirrored: 0,
            mirror_failures: 0,
        };
        let mut committed_records = 0;

        for (index, batch) in records.chunks(batch_size).enumerate() {
            let started = Instant::now();
            let write = match self.relational.upsert_batch(kind, batch).await {
                Ok(write) => write,
                Err(source) => {
                    record_batch_failed(kind.name());
                    tracing::error!(
                        entity = %kind,
                        batch_index = index,
                        batches,
                        committed_records,
                        error = %source,
                        "sync batch rolled back"
                    );
                    return Err(SyncError::BatchFailed {
                        entity: kind,
                        batch_index: index,
                        batches,
                        committed_batches: index,
                        committed_records,
                        source,
                    });
                }
            };
            record_batch_committed(kind.name(), batch.len(), started.elapsed().as_secs_f64());
            committed_records += batch.len();

            let (mirrored, mirror_failures) = self.mirror(kind, batch).await;
            tracing::debug!(
                entity = %kind,
                batch_index = index,
                records = batch.len(),
                inserted = write.inserted,
                updated = write.updated,
                unchanged = write.unchanged,
                mirrored,
                mirror_failures,
                "sync batch committed"
            );

            report.mirrored += mirrored;
            report.mirror_failures += mirror_failures;
            report.batches.push(BatchReport {
                index,
                records: batch.len(),
                write,
                mirrored,
                mirror_failures,
            });
        }

        tracing::info!(
            entity = %kind,
            received = report.received,
            batches = report.batches.len(),
            mirrored = report.mirrored,
            mirror_failures = report.mirror_failures,
            "sync complete"
        );
        Ok(report)
    }

    /// Merge-upserts every record of a committed batch into the document store.
    async fn mirror(&self, kind: EntityKind, batch: &[Record]) -> (usize, usize) {
        let (mut mirrored, mut failures) = (0, 0);
        for record in batch {
            if mirror_one(self.documents.as_ref(), kind, record).await.is_some() {
                mirrored += 1;
            } else {
                failures += 1;
            }
        }
        (mirrored, failures)
    }
}

/// Mirrors a single record, logging instead of failing.
///
/// Returns the outcome, or `None` if the document write failed.
pub(crate) async fn mirror_one(
    documents: &dyn DocumentStore,
    kind: EntityKind,
    record: &Record,
) -> Option<MergeOutcome> {
    match documents.merge_upsert(kind, record.id(), record.body()).await {
        Ok(outcome) => {
            record_mirror_write(kind.collection(), outcome.as_str());
            Some(outcome)
        }
        Err(err) => {
            record_mirror_failure(kind.collection());
            tracing::warn!(
                entity = %kind,
                id = %record.id(),
                error = %err,
                "document mirror write failed"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ObjectDocumentStore;
    use crate::relational::SqliteStore;
    use quay_core::MemoryBackend;
    use serde_json::json;

    fn engine() -> SyncEngine {
        SyncEngine::new(
            Arc::new(SqliteStore::open_in_memory().expect("sqlite")),
            Arc::new(ObjectDocumentStore::new(Arc::new(MemoryBackend::new()))),
        )
    }

    #[test]
    fn resolves_only_syncable_entities() {
        assert_eq!(SyncEngine::resolve_entity("vessel").ok(), Some(EntityKind::Vessel));
        assert!(matches!(
            SyncEngine::resolve_entity("Spaceship"),
            Err(SyncError::UnknownEntity { .. })
        ));
        assert!(matches!(
            SyncEngine::resolve_entity("Authorization"),
            Err(SyncError::NotSyncable { .. })
        ));
    }

    #[test]
    fn prepare_reports_offending_index() {
        let err = SyncEngine::prepare_records(vec![
            json!({"id": "ok"}),
            json!({"id": "also-ok"}),
            json!({"name": "no id"}),
        ])
        .expect_err("missing id");
        assert!(matches!(err, SyncError::InvalidRecord { index: 2, .. }));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn empty_request_produces_no_batches() {
        let report = engine().sync("Company", Vec::new()).await.expect("sync");
        assert_eq!(report.received, 0);
        assert!(report.batches.is_empty());
    }

    #[tokio::test]
    async fn batches_follow_configured_size() {
        let engine = engine().with_limits(SyncLimits {
            batch_size: 2,
            event_sync_max_records: 10,
        });
        let records: Vec<_> = (0..5).map(|i| json!({"id": format!("c-{i}")})).collect();
        let report = engine.sync("company", records).await.expect("sync");
        let sizes: Vec<_> = report.batches.iter().map(|b| b.records).collect();
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(report.mirrored, 5);
        assert_eq!(report.mirror_failures, 0);
    }

    #[tokio::test]
    async fn event_cap_is_checked_before_validation() {
        let engine = engine().with_limits(SyncLimits {
            batch_size: 100,
            event_sync_max_records: 3,
        });
        let records = vec![json!("not even an object"); 4];
        let err = engine.sync_events(records).await.expect_err("over cap");
        assert!(matches!(err, SyncError::TooManyRecords { count: 4, max: 3 }));
    }
}
