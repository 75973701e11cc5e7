//! The document store: a secondary, schemaless mirror of relational records.
//!
//! Documents are JSON objects keyed by collection and id. The only write
//! operation the sync protocol needs is [`DocumentStore::merge_upsert`]:
//! create the document if it is absent, otherwise shallow-merge the given
//! fields into it. Unlike the relational upsert, fields missing from the
//! incoming record are kept.
//!
//! Two implementations:
//! - [`ObjectDocumentStore`]: one JSON object per document on a
//!   [`StorageBackend`], merged with compare-and-swap on the object version.
//! - [`SqliteDocumentStore`]: a versioned `documents` table in its own
//!   database file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use quay_core::{
    format_timestamp, shallow_merge, EntityKind, Fields, RecordId, StorageBackend,
    WritePrecondition, WriteResult,
};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::metrics::record_cas_retry;
use crate::sqlite::SharedConnection;

/// Default number of CAS retries for a merge against object storage.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 5;

/// What a merge-upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The document did not exist and was created.
    Created,
    /// Fields were merged into an existing document.
    Merged,
    /// The existing document already held every field value.
    Unchanged,
}

impl MergeOutcome {
    /// Returns the outcome as a metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Merged => "merged",
            Self::Unchanged => "unchanged",
        }
    }
}

/// The document store contract.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Creates the document or shallow-merges `fields` into it.
    async fn merge_upsert(
        &self,
        kind: EntityKind,
        id: &RecordId,
        fields: &Fields,
    ) -> Result<MergeOutcome>;

    /// Reads a document.
    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Fields>>;

    /// Deletes a document, returning whether it existed.
    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool>;

    /// Lists document ids of a collection in ascending order.
    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>>;

    /// Checks the store is reachable.
    async fn ping(&self) -> Result<()>;
}

// ============================================================================
// Object storage
// ============================================================================

const DOCUMENT_ROOT: &str = "documents/";

/// Document store on object storage.
///
/// Layout: `documents/{collection}/{id}.json`.
#[derive(Clone)]
pub struct ObjectDocumentStore {
    backend: Arc<dyn StorageBackend>,
    max_cas_retries: u32,
}

impl std::fmt::Debug for ObjectDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDocumentStore")
            .field("backend", &"StorageBackend")
            .field("max_cas_retries", &self.max_cas_retries)
            .finish()
    }
}

impl ObjectDocumentStore {
    /// Creates a store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    /// Sets how many times a lost CAS race is retried.
    #[must_use]
    pub const fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    /// Returns the object path of a document.
    #[must_use]
    pub fn path(kind: EntityKind, id: &RecordId) -> String {
        format!("{DOCUMENT_ROOT}{}/{id}.json", kind.collection())
    }

    fn prefix(kind: EntityKind) -> String {
        format!("{DOCUMENT_ROOT}{}/", kind.collection())
    }

    async fn read(&self, path: &str) -> Result<Option<Fields>> {
        match self.backend.get(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(quay_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DocumentStore for ObjectDocumentStore {
    async fn merge_upsert(
        &self,
        kind: EntityKind,
        id: &RecordId,
        fields: &Fields,
    ) -> Result<MergeOutcome> {
        let path = Self::path(kind, id);

        for attempt in 0..=self.max_cas_retries {
            if attempt > 0 {
                record_cas_retry("document_merge");
                tracing::debug!(path = %path, attempt, "retrying document merge");
            }

            let (document, precondition, outcome) = match self.backend.head(&path).await? {
                None => (fields.clone(), WritePrecondition::DoesNotExist, MergeOutcome::Created),
                Some(meta) => {
                    let Some(mut current) = self.read(&path).await? else {
                        continue;
                    };
                    if !shallow_merge(&mut current, fields) {
                        return Ok(MergeOutcome::Unchanged);
                    }
                    (
                        current,
                        WritePrecondition::MatchesVersion(meta.version),
                        MergeOutcome::Merged,
                    )
                }
            };

            let data = Bytes::from(serde_json::to_vec(&document)?);
            match self.backend.put(&path, data, precondition).await? {
                WriteResult::Success { .. } => return Ok(outcome),
                WriteResult::PreconditionFailed { current_version } => {
                    tracing::debug!(
                        path = %path,
                        current_version = %current_version,
                        "document changed underneath merge"
                    );
                }
            }
        }

        Err(StoreError::CasFailed {
            message: format!(
                "document {path} kept changing after {} attempts",
                self.max_cas_retries + 1
            ),
        })
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Fields>> {
        self.read(&Self::path(kind, id)).await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let path = Self::path(kind, id);
        let existed = self.backend.head(&path).await?.is_some();
        self.backend.delete(&path).await?;
        Ok(existed)
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let prefix = Self::prefix(kind);
        let mut ids: Vec<String> = self
            .backend
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|meta| {
                meta.path
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> Result<()> {
        self.backend.head(DOCUMENT_ROOT).await?;
        Ok(())
    }
}

// ============================================================================
// SQLite
// ============================================================================

const DOCUMENT_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (\
     collection TEXT NOT NULL, \
     id TEXT NOT NULL, \
     body TEXT NOT NULL, \
     version INTEGER NOT NULL, \
     updated_at TEXT NOT NULL, \
     PRIMARY KEY (collection, id));";

/// Document store on a dedicated `SQLite` database.
///
/// Every document carries a version that increases by one per change.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    conn: SharedConnection,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// Opens (or creates) a document database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::open(path, DOCUMENT_SCHEMA)?,
        })
    }

    /// Opens a private in-memory document database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::open_in_memory(DOCUMENT_SCHEMA)?,
        })
    }

    /// Returns the stored version of a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn version(&self, kind: EntityKind, id: &RecordId) -> Result<Option<i64>> {
        let id = id.to_string();
        self.conn
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT version FROM documents WHERE collection = ?1 AND id = ?2",
                        params![kind.collection(), id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn merge_upsert(
        &self,
        kind: EntityKind,
        id: &RecordId,
        fields: &Fields,
    ) -> Result<MergeOutcome> {
        let id = id.to_string();
        let fields = fields.clone();
        self.conn
            .run(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT body, version FROM documents WHERE collection = ?1 AND id = ?2",
                        params![kind.collection(), id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let now = format_timestamp(Utc::now());

                let outcome = match existing {
                    None => {
                        tx.execute(
                            "INSERT INTO documents (collection, id, body, version, updated_at) \
                             VALUES (?1, ?2, ?3, 1, ?4)",
                            params![kind.collection(), id, serde_json::to_string(&fields)?, now],
                        )?;
                        MergeOutcome::Created
                    }
                    Some((body, version)) => {
                        let mut current: Fields = serde_json::from_str(&body)?;
                        if !shallow_merge(&mut current, &fields) {
                            return Ok(MergeOutcome::Unchanged);
                        }
                        tx.execute(
                            "UPDATE documents SET body = ?3, version = version + 1, updated_at = ?4 \
                             WHERE collection = ?1 AND id = ?2 AND version = ?5",
                            params![
                                kind.collection(),
                                id,
                                serde_json::to_string(&current)?,
                                now,
                                version
                            ],
                        )?;
                        MergeOutcome::Merged
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<Fields>> {
        let id = id.to_string();
        self.conn
            .run(move |conn| {
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                        params![kind.collection(), id],
                        |row| row.get(0),
                    )
                    .optional()?;
                body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                    .transpose()
            })
            .await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .run(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                    params![kind.collection(), id],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        self.conn
            .run(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM documents WHERE collection = ?1 ORDER BY id")?;
                let rows = stmt.query_map(params![kind.collection()], |row| row.get(0))?;
                Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
            })
            .await
    }

    async fn ping(&self) -> Result<()> {
        self.conn.ping().await
    }
}
