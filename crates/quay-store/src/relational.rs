//! The relational store: the source of truth for every entity.
//!
//! [`RelationalStore`] is the contract the sync engine and the CRUD
//! repository write through. [`SqliteStore`] implements it on `SQLite`, with
//! one table per collection holding the JSON body next to bookkeeping
//! timestamps.
//!
//! ## Batch semantics
//!
//! [`RelationalStore::upsert_batch`] runs inside exactly one transaction:
//! either every record of the batch is applied or none is. A record whose
//! body is byte-identical to the stored body is left alone, which is what
//! makes re-submitting a batch idempotent.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use quay_core::{
    format_timestamp, parse_timestamp, shallow_merge, EntityKind, Fields, Record, RecordId,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::sqlite::SharedConnection;

/// Default number of records per list page.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page a caller may ask for.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Maximum number of equality filters on one list query.
pub const MAX_FILTERS: usize = 8;

/// A record as persisted in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// Record identifier.
    pub id: String,
    /// Collection the record lives in.
    pub collection: String,
    /// Full JSON body, including `id`.
    pub body: Fields,
    /// When the row was first written.
    pub created_at: DateTime<Utc>,
    /// When the row body last changed.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one batch upsert transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchWrite {
    /// Rows that did not exist before.
    pub inserted: usize,
    /// Rows whose body was replaced.
    pub updated: usize,
    /// Rows whose body already matched.
    pub unchanged: usize,
}

impl BatchWrite {
    /// Total records applied by the batch.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Filters and pagination for listing a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Equality filters on top-level body fields.
    pub filters: Vec<(String, String)>,
    /// Page size; defaults to [`DEFAULT_PAGE_LIMIT`].
    pub limit: Option<usize>,
    /// Token returned by the previous page.
    pub page_token: Option<String>,
}

impl ListQuery {
    /// Creates an unfiltered query for the first page.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Continues from a previous page.
    #[must_use]
    pub fn with_page_token(mut self, token: impl Into<String>) -> Self {
        self.page_token = Some(token.into());
        self
    }

    /// Validates filters and resolves the effective page size.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidInput` for bad field names, too many
    /// filters, or a limit outside `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> Result<usize> {
        if self.filters.len() > MAX_FILTERS {
            return Err(StoreError::invalid(format!(
                "at most {MAX_FILTERS} filters are allowed"
            )));
        }
        for (field, _) in &self.filters {
            if field.is_empty()
                || !field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(StoreError::invalid(format!(
                    "invalid filter field '{field}'"
                )));
            }
        }
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(StoreError::invalid(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(limit)
    }
}

/// One page of records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records ordered by id.
    pub records: Vec<StoredRecord>,
    /// Token for the next page, if there is one.
    pub next_page_token: Option<String>,
}

/// Time bounds for a dashboard aggregation.
#[derive(Debug, Clone, Copy)]
pub struct DashboardWindow {
    /// Reference instant.
    pub now: DateTime<Utc>,
    /// How far back entry/exit events are counted.
    pub lookback: Duration,
    /// How far ahead expiring authorizations and documents are reported.
    pub horizon: Duration,
}

/// People currently on board a vessel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VesselOccupancy {
    /// Vessel identifier.
    pub vessel_id: String,
    /// Users whose latest event is an entry onto the vessel.
    pub people: u64,
}

/// A record that expires inside the dashboard horizon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringRecord {
    /// Record identifier.
    pub id: String,
    /// The user the record belongs to.
    pub owner_id: Option<String>,
    /// Expiry instant as stored.
    pub expires_at: String,
}

/// Aggregated operational view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    /// Reference instant.
    pub generated_at: DateTime<Utc>,
    /// Start of the event window.
    pub window_start: DateTime<Utc>,
    /// End of the expiry horizon.
    pub horizon_end: DateTime<Utc>,
    /// Record count per collection.
    pub totals: BTreeMap<String, u64>,
    /// Entry events inside the window.
    pub entries: u64,
    /// Exit events inside the window.
    pub exits: u64,
    /// Occupancy per vessel.
    pub on_board: Vec<VesselOccupancy>,
    /// Authorizations ending inside the horizon.
    pub expiring_authorizations: Vec<ExpiringRecord>,
    /// Documents expiring inside the horizon.
    pub expiring_documents: Vec<ExpiringRecord>,
}

/// The relational store contract.
#[async_trait]
pub trait RelationalStore: Send + Sync + 'static {
    /// Inserts a new record.
    ///
    /// Returns `StoreError::AlreadyExists` if the id is taken.
    async fn insert(&self, kind: EntityKind, record: Record) -> Result<StoredRecord>;

    /// Reads a record by id.
    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<StoredRecord>>;

    /// Lists records ordered by id.
    async fn list(&self, kind: EntityKind, query: &ListQuery) -> Result<Page>;

    /// Shallow-merges `patch` into the stored body in one transaction.
    ///
    /// Returns `StoreError::NotFound` if the record does not exist.
    async fn update(&self, kind: EntityKind, id: &RecordId, patch: Fields)
        -> Result<StoredRecord>;

    /// Deletes a record, returning whether it existed.
    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool>;

    /// Upserts a batch of records inside a single transaction.
    ///
    /// The stored body is replaced by the incoming one (last write wins).
    async fn upsert_batch(&self, kind: EntityKind, records: &[Record]) -> Result<BatchWrite>;

    /// Counts records of a kind.
    async fn count(&self, kind: EntityKind) -> Result<u64>;

    /// Computes the operational dashboard.
    async fn dashboard(&self, window: &DashboardWindow) -> Result<Dashboard>;

    /// Checks the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Reads every page of a query.
///
/// # Errors
///
/// Returns the first store error.
pub async fn list_all(
    store: &dyn RelationalStore,
    kind: EntityKind,
    query: ListQuery,
) -> Result<Vec<StoredRecord>> {
    let mut query = query.with_limit(MAX_PAGE_LIMIT);
    let mut records = Vec::new();
    loop {
        let page = store.list(kind, &query).await?;
        records.extend(page.records);
        match page.next_page_token {
            Some(token) => query.page_token = Some(token),
            None => return Ok(records),
        }
    }
}

/// `SQLite`-backed relational store.
///
/// One table per collection; a single connection guarded by a mutex, with
/// every call running on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: SharedConnection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

type RawRow = (String, String, String, String);

impl SqliteStore {
    /// Opens (or creates) a database file and ensures the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::open(path, &schema())?,
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: SharedConnection::open_in_memory(&schema())?,
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        self.conn.run(f).await
    }
}

fn schema() -> String {
    let mut ddl = String::new();
    for kind in EntityKind::ALL {
        let _ = write!(
            ddl,
            "CREATE TABLE IF NOT EXISTS {} (\
                 id TEXT PRIMARY KEY NOT NULL, \
                 body TEXT NOT NULL, \
                 created_at TEXT NOT NULL, \
                 updated_at TEXT NOT NULL);",
            kind.collection()
        );
    }
    ddl
}

fn now_string() -> String {
    format_timestamp(Utc::now())
}

fn to_stored(kind: EntityKind, (id, body, created_at, updated_at): RawRow) -> Result<StoredRecord> {
    let body: Fields = serde_json::from_str(&body)?;
    let parse = |s: &str| {
        parse_timestamp(s).ok_or_else(|| StoreError::Serialization {
            message: format!("invalid stored timestamp '{s}' on {kind} '{id}'"),
        })
    };
    Ok(StoredRecord {
        created_at: parse(&created_at)?,
        updated_at: parse(&updated_at)?,
        collection: kind.collection().to_string(),
        id,
        body,
    })
}

fn select_row(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<RawRow>> {
    let sql = format!(
        "SELECT id, body, created_at, updated_at FROM {} WHERE id = ?1",
        kind.collection()
    );
    Ok(conn
        .query_row(&sql, params![id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?)
}

fn apply_upsert(
    tx: &Transaction<'_>,
    kind: EntityKind,
    record: &Record,
    now: &str,
) -> Result<Outcome> {
    let table = kind.collection();
    let body = serde_json::to_string(record.body())?;
    let existing: Option<String> = tx
        .prepare_cached(&format!("SELECT body FROM {table} WHERE id = ?1"))?
        .query_row(params![record.id().as_str()], |row| row.get(0))
        .optional()?;

    let outcome = match existing {
        Some(ref stored) if *stored == body => return Ok(Outcome::Unchanged),
        Some(_) => Outcome::Updated,
        None => Outcome::Inserted,
    };

    tx.prepare_cached(&format!(
        "INSERT INTO {table} (id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3) \
         ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at"
    ))?
    .execute(params![record.id().as_str(), body, now])?;
    Ok(outcome)
}

enum Outcome {
    Inserted,
    Updated,
    Unchanged,
}

/// SQL for one equality filter on a top-level field.
///
/// `true` and `false` match the JSON booleans or the identical string. Any
/// other value is compared with the field's text form, and never matches a
/// boolean, so `1` does not select `true`.
fn filter_clause(value: &str, path_idx: usize, value_idx: usize) -> String {
    if matches!(value, "true" | "false") {
        format!(
            " AND (json_type(body, ?{path_idx}) = ?{value_idx} \
             OR (json_type(body, ?{path_idx}) = 'text' AND json_extract(body, ?{path_idx}) = ?{value_idx}))"
        )
    } else {
        format!(
            " AND json_type(body, ?{path_idx}) NOT IN ('true', 'false') \
             AND CAST(json_extract(body, ?{path_idx}) AS TEXT) = ?{value_idx}"
        )
    }
}

fn query_list(
    conn: &Connection,
    kind: EntityKind,
    query: &ListQuery,
    limit: usize,
) -> Result<Page> {
    let mut sql = format!(
        "SELECT id, body, created_at, updated_at FROM {} WHERE 1 = 1",
        kind.collection()
    );
    let mut args: Vec<String> = Vec::new();

    if let Some(token) = &query.page_token {
        args.push(token.clone());
        let _ = write!(sql, " AND id > ?{}", args.len());
    }
    for (field, value) in &query.filters {
        args.push(format!("$.{field}"));
        let path_idx = args.len();
        args.push(value.clone());
        sql.push_str(&filter_clause(value, path_idx, args.len()));
    }
    let _ = write!(sql, " ORDER BY id LIMIT {}", limit + 1);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;

    let mut records = Vec::with_capacity(limit);
    let mut has_more = false;
    for row in rows {
        if records.len() == limit {
            has_more = true;
            break;
        }
        records.push(to_stored(kind, row?)?);
    }

    let next_page_token = if has_more {
        records.last().map(|r: &StoredRecord| r.id.clone())
    } else {
        None
    };
    Ok(Page {
        records,
        next_page_token,
    })
}

fn count_rows(conn: &Connection, kind: EntityKind) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", kind.collection()),
        [],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Columns and extra predicate describing one "expiring soon" report.
struct ExpirySource {
    table: &'static str,
    owner_field: &'static str,
    expiry_field: &'static str,
    extra: &'static str,
}

const EXPIRING_AUTHORIZATIONS: ExpirySource = ExpirySource {
    table: "authorizations",
    owner_field: "userId",
    expiry_field: "validUntil",
    extra: " AND COALESCE(json_extract(body, '$.revoked'), 0) = 0",
};

const EXPIRING_DOCUMENTS: ExpirySource = ExpirySource {
    table: "documents",
    owner_field: "ownerId",
    expiry_field: "expiresAt",
    extra: "",
};

fn expiring(
    conn: &Connection,
    source: &ExpirySource,
    from: &str,
    until: &str,
) -> Result<Vec<ExpiringRecord>> {
    let ExpirySource {
        table,
        owner_field,
        expiry_field,
        extra,
    } = source;
    let sql = format!(
        "SELECT id, CAST(json_extract(body, '$.{owner_field}') AS TEXT), \
                CAST(json_extract(body, '$.{expiry_field}') AS TEXT) \
         FROM {table} \
         WHERE julianday(json_extract(body, '$.{expiry_field}')) >= julianday(?1) \
           AND julianday(json_extract(body, '$.{expiry_field}')) <= julianday(?2){extra} \
         ORDER BY julianday(json_extract(body, '$.{expiry_field}')), id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![from, until], |row| {
        Ok(ExpiringRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            expires_at: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn compute_dashboard(conn: &Connection, window: &DashboardWindow) -> Result<Dashboard> {
    let window_start = window.now - window.lookback;
    let horizon_end = window.now + window.horizon;
    let now = format_timestamp(window.now);
    let start = format_timestamp(window_start);
    let end = format_timestamp(horizon_end);

    let mut totals = BTreeMap::new();
    for kind in EntityKind::ALL {
        totals.insert(kind.collection().to_string(), count_rows(conn, kind)?);
    }

    let (mut entries, mut exits) = (0_u64, 0_u64);
    {
        let mut stmt = conn.prepare(
            "SELECT json_extract(body, '$.kind'), COUNT(*) FROM events \
             WHERE julianday(json_extract(body, '$.occurredAt')) >= julianday(?1) \
               AND julianday(json_extract(body, '$.occurredAt')) <= julianday(?2) \
             GROUP BY 1",
        )?;
        let rows = stmt.query_map(params![start, now], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            let count = u64::try_from(count).unwrap_or_default();
            match kind.as_deref() {
                Some("entry") => entries = count,
                Some("exit") => exits = count,
                _ => {}
            }
        }
    }

    let on_board = {
        let mut stmt = conn.prepare(
            "SELECT vessel_id, COUNT(*) FROM ( \
                 SELECT CAST(json_extract(body, '$.vesselId') AS TEXT) AS vessel_id, \
                        json_extract(body, '$.kind') AS kind, \
                        ROW_NUMBER() OVER ( \
                            PARTITION BY json_extract(body, '$.userId') \
                            ORDER BY julianday(json_extract(body, '$.occurredAt')) DESC, id DESC \
                        ) AS rn \
                 FROM events \
                 WHERE json_extract(body, '$.userId') IS NOT NULL \
                   AND julianday(json_extract(body, '$.occurredAt')) <= julianday(?1)) \
             WHERE rn = 1 AND kind = 'entry' AND vessel_id IS NOT NULL \
             GROUP BY vessel_id ORDER BY vessel_id",
        )?;
        let rows = stmt.query_map(params![now], |row| {
            Ok(VesselOccupancy {
                vessel_id: row.get(0)?,
                people: u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let expiring_authorizations = expiring(conn, &EXPIRING_AUTHORIZATIONS, &now, &end)?;
    let expiring_documents = expiring(conn, &EXPIRING_DOCUMENTS, &now, &end)?;

    Ok(Dashboard {
        generated_at: window.now,
        window_start,
        horizon_end,
        totals,
        entries,
        exits,
        on_board,
        expiring_authorizations,
        expiring_documents,
    })
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn insert(&self, kind: EntityKind, record: Record) -> Result<StoredRecord> {
        self.run(move |conn| {
            let now = now_string();
            let body = serde_json::to_string(record.body())?;
            let changed = conn.execute(
                &format!(
                    "INSERT INTO {} (id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3) \
                     ON CONFLICT(id) DO NOTHING",
                    kind.collection()
                ),
                params![record.id().as_str(), body, now],
            )?;
            if changed == 0 {
                return Err(StoreError::AlreadyExists {
                    entity: kind,
                    id: record.id().to_string(),
                });
            }
            let row = select_row(conn, kind, record.id().as_str())?
                .ok_or_else(|| StoreError::internal("inserted row vanished"))?;
            to_stored(kind, row)
        })
        .await
    }

    async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<Option<StoredRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            select_row(conn, kind, &id)?
                .map(|row| to_stored(kind, row))
                .transpose()
        })
        .await
    }

    async fn list(&self, kind: EntityKind, query: &ListQuery) -> Result<Page> {
        let limit = query.effective_limit()?;
        let query = query.clone();
        self.run(move |conn| query_list(conn, kind, &query, limit))
            .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &RecordId,
        patch: Fields,
    ) -> Result<StoredRecord> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let (_, body, _, _) =
                select_row(&tx, kind, &id)?.ok_or_else(|| StoreError::not_found(kind, id.clone()))?;
            let mut merged: Fields = serde_json::from_str(&body)?;
            if shallow_merge(&mut merged, &patch) {
                merged.insert("id".to_string(), Value::String(id.clone()));
                kind.check_invariants(&merged)?;
                tx.execute(
                    &format!(
                        "UPDATE {} SET body = ?2, updated_at = ?3 WHERE id = ?1",
                        kind.collection()
                    ),
                    params![id, serde_json::to_string(&merged)?, now_string()],
                )?;
            }
            let row = select_row(&tx, kind, &id)?
                .ok_or_else(|| StoreError::internal("updated row vanished"))?;
            tx.commit()?;
            to_stored(kind, row)
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.collection()),
                params![id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn upsert_batch(&self, kind: EntityKind, records: &[Record]) -> Result<BatchWrite> {
        let records = records.to_vec();
        self.run(move |conn| {
            let now = now_string();
            let tx = conn.transaction()?;
            let mut write = BatchWrite::default();
            for record in &records {
                match apply_upsert(&tx, kind, record, &now)? {
                    Outcome::Inserted => write.inserted += 1,
                    Outcome::Updated => write.updated += 1,
                    Outcome::Unchanged => write.unchanged += 1,
                }
            }
            tx.commit()?;
            Ok(write)
        })
        .await
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        self.run(move |conn| count_rows(conn, kind)).await
    }

    async fn dashboard(&self, window: &DashboardWindow) -> Result<Dashboard> {
        let window = *window;
        self.run(move |conn| compute_dashboard(conn, &window)).await
    }

    async fn ping(&self) -> Result<()> {
        self.conn.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).expect("valid record")
    }

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("in-memory store")
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = store();
        let stored = store
            .insert(
                EntityKind::Vessel,
                record(json!({"id": "v-1", "name": "MV Aurora", "companyId": "c-1"})),
            )
            .await
            .expect("insert");
        assert_eq!(stored.collection, "vessels");
        assert_eq!(stored.created_at, stored.updated_at);

        let fetched = store
            .get(EntityKind::Vessel, &RecordId::new("v-1").expect("id"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.body["name"], json!("MV Aurora"));

        let missing = store
            .get(EntityKind::Company, &RecordId::new("v-1").expect("id"))
            .await
            .expect("get");
        assert!(missing.is_none(), "kinds live in separate tables");
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = store();
        store
            .insert(EntityKind::Company, record(json!({"id": "c-1", "name": "Acme"})))
            .await
            .expect("insert");
        let err = store
            .insert(EntityKind::Company, record(json!({"id": "c-1", "name": "Other"})))
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn upsert_batch_counts_outcomes_and_is_idempotent() {
        let store = store();
        let batch = vec![
            record(json!({"id": "e-1", "kind": "entry"})),
            record(json!({"id": "e-2", "kind": "exit"})),
        ];
        let first = store
            .upsert_batch(EntityKind::Event, &batch)
            .await
            .expect("first");
        assert_eq!(first, BatchWrite { inserted: 2, updated: 0, unchanged: 0 });

        let before = store
            .get(EntityKind::Event, &RecordId::new("e-1").expect("id"))
            .await
            .expect("get")
            .expect("present");

        let second = store
            .upsert_batch(EntityKind::Event, &batch)
            .await
            .expect("second");
        assert_eq!(second, BatchWrite { inserted: 0, updated: 0, unchanged: 2 });
        assert_eq!(store.count(EntityKind::Event).await.expect("count"), 2);

        let after = store
            .get(EntityKind::Event, &RecordId::new("e-1").expect("id"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn upsert_replaces_body() {
        let store = store();
        store
            .upsert_batch(
                EntityKind::User,
                &[record(json!({"id": "u-1", "name": "Ana", "role": "crew"}))],
            )
            .await
            .expect("seed");
        let write = store
            .upsert_batch(EntityKind::User, &[record(json!({"id": "u-1", "name": "Ana B."}))])
            .await
            .expect("upsert");
        assert_eq!(write.updated, 1);

        let stored = store
            .get(EntityKind::User, &RecordId::new("u-1").expect("id"))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.body.get("role"), None);
        assert_eq!(stored.body["name"], json!("Ana B."));
    }

    #[tokio::test]
    async fn update_merges_and_checks_invariants() {
        let store = store();
        store
            .insert(
                EntityKind::Authorization,
                record(json!({
                    "id": "a-1",
                    "userId": "u-1",
                    "vesselId": "v-1",
                    "validFrom": "2024-05-01T00:00:00.000Z",
                    "validUntil": "2024-06-01T00:00:00.000Z"
                })),
            )
            .await
            .expect("insert");

        let id = RecordId::new("a-1").expect("id");
        let patch = json!({"revoked": true}).as_object().cloned().expect("object");
        let updated = store
            .update(EntityKind::Authorization, &id, patch)
            .await
            .expect("update");
        assert_eq!(updated.body["revoked"], json!(true));
        assert_eq!(updated.body["userId"], json!("u-1"));

        let patch = json!({"validUntil": "2024-04-01T00:00:00.000Z"})
            .as_object()
            .cloned()
            .expect("object");
        let err = store
            .update(EntityKind::Authorization, &id, patch)
            .await
            .expect_err("inverted window");
        assert!(matches!(err, StoreError::InvalidInput { .. }));

        let unchanged = store
            .get(EntityKind::Authorization, &id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(unchanged.body["validUntil"], json!("2024-06-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let err = store()
            .update(
                EntityKind::Vessel,
                &RecordId::new("ghost").expect("id"),
                Fields::new(),
            )
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store();
        let records: Vec<_> = (0..5)
            .map(|i| {
                record(json!({
                    "id": format!("p-{i}"),
                    "name": format!("Portal {i}"),
                    "areaId": if i % 2 == 0 { "north" } else { "south" },
                    "active": i < 3
                }))
            })
            .collect();
        store
            .upsert_batch(EntityKind::Portal, &records)
            .await
            .expect("seed");

        let north = store
            .list(EntityKind::Portal, &ListQuery::new().with_filter("areaId", "north"))
            .await
            .expect("list");
        let ids: Vec<_> = north.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["p-0", "p-2", "p-4"]);

        let active_north = store
            .list(
                EntityKind::Portal,
                &ListQuery::new()
                    .with_filter("areaId", "north")
                    .with_filter("active", "true"),
            )
            .await
            .expect("list");
        assert_eq!(active_north.records.len(), 2);

        let first = store
            .list(EntityKind::Portal, &ListQuery::new().with_limit(2))
            .await
            .expect("page 1");
        assert_eq!(first.records.len(), 2);
        let token = first.next_page_token.clone().expect("more pages");

        let second = store
            .list(
                EntityKind::Portal,
                &ListQuery::new().with_limit(2).with_page_token(token),
            )
            .await
            .expect("page 2");
        assert_eq!(second.records[0].id, "p-2");

        let last = store
            .list(
                EntityKind::Portal,
                &ListQuery::new().with_limit(2).with_page_token("p-3"),
            )
            .await
            .expect("page 3");
        assert_eq!(last.records.len(), 1);
        assert!(last.next_page_token.is_none());
    }

    #[tokio::test]
    async fn boolean_filters_only_match_booleans_or_identical_strings() {
        let store = store();
        store
            .upsert_batch(
                EntityKind::Portal,
                &[
                    record(json!({"id": "p-1", "name": "Gate 1", "status": "true"})),
                    record(json!({"id": "p-2", "name": "Gate 2", "flag": true})),
                    record(json!({"id": "p-3", "name": "Gate 3", "flag": 1})),
                    record(json!({"id": "p-4", "name": "Gate 4", "flag": false, "status": true})),
                ],
            )
            .await
            .expect("seed");

        let ids = |field: &str, value: &str| {
            let query = ListQuery::new().with_filter(field, value);
            let store = store.clone();
            async move {
                store
                    .list(EntityKind::Portal, &query)
                    .await
                    .expect("list")
                    .records
                    .into_iter()
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            }
        };

        assert_eq!(ids("status", "true").await, ["p-1", "p-4"]);
        assert_eq!(ids("flag", "true").await, ["p-2"]);
        assert_eq!(ids("flag", "1").await, ["p-3"]);
        assert!(ids("flag", "0").await.is_empty());
        assert_eq!(ids("flag", "false").await, ["p-4"]);
    }

    #[tokio::test]
    async fn batch_aborted_midway_rolls_back_every_row() {
        let store = store();
        store
            .run(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_e3 BEFORE INSERT ON events \
                     WHEN NEW.id = 'e-3' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )?;
                Ok(())
            })
            .await
            .expect("trigger");

        let batch: Vec<_> = (1..=5)
            .map(|i| record(json!({"id": format!("e-{i}"), "kind": "entry"})))
            .collect();
        let err = store.upsert_batch(EntityKind::Event, &batch).await;

        assert!(matches!(err, Err(StoreError::Database { .. })));
        assert_eq!(store.count(EntityKind::Event).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn list_rejects_bad_queries() {
        let store = store();
        let bad_field = ListQuery::new().with_filter("name'; DROP TABLE users; --", "x");
        assert!(store.list(EntityKind::User, &bad_field).await.is_err());
        assert!(store
            .list(EntityKind::User, &ListQuery::new().with_limit(0))
            .await
            .is_err());
        assert!(store
            .list(EntityKind::User, &ListQuery::new().with_limit(MAX_PAGE_LIMIT + 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = store();
        store
            .insert(EntityKind::Area, record(json!({"id": "north", "name": "North Quay"})))
            .await
            .expect("insert");
        let id = RecordId::new("north").expect("id");
        assert!(store.delete(EntityKind::Area, &id).await.expect("delete"));
        assert!(!store.delete(EntityKind::Area, &id).await.expect("delete again"));
    }

    #[tokio::test]
    async fn dashboard_aggregates_events_and_expiries() {
        let store = store();
        let now = parse_timestamp("2024-05-10T12:00:00Z").expect("ts");
        store
            .upsert_batch(
                EntityKind::Event,
                &[
                    record(json!({"id": "e-1", "userId": "u-1", "vesselId": "v-1", "kind": "entry", "occurredAt": "2024-05-10T08:00:00.000Z"})),
                    record(json!({"id": "e-2", "userId": "u-2", "vesselId": "v-1", "kind": "entry", "occurredAt": "2024-05-10T09:00:00.000Z"})),
                    record(json!({"id": "e-3", "userId": "u-2", "vesselId": "v-1", "kind": "exit", "occurredAt": "2024-05-10T10:00:00.000Z"})),
                    record(json!({"id": "e-4", "userId": "u-3", "vesselId": "v-2", "kind": "entry", "occurredAt": "2024-05-01T10:00:00.000Z"})),
                ],
            )
            .await
            .expect("events");
        store
            .upsert_batch(
                EntityKind::Authorization,
                &[
                    record(json!({"id": "a-1", "userId": "u-1", "validUntil": "2024-05-20T00:00:00.000Z"})),
                    record(json!({"id": "a-2", "userId": "u-2", "validUntil": "2024-05-15T00:00:00.000Z", "revoked": true})),
                    record(json!({"id": "a-3", "userId": "u-3", "validUntil": "2025-01-01T00:00:00.000Z"})),
                ],
            )
            .await
            .expect("authorizations");
        store
            .upsert_batch(
                EntityKind::Document,
                &[record(json!({"id": "d-1", "ownerId": "u-1", "expiresAt": "2024-05-11T00:00:00.000Z"}))],
            )
            .await
            .expect("documents");

        let dashboard = store
            .dashboard(&DashboardWindow {
                now,
                lookback: Duration::hours(24),
                horizon: Duration::days(30),
            })
            .await
            .expect("dashboard");

        assert_eq!(dashboard.totals["events"], 4);
        assert_eq!(dashboard.totals["vessels"], 0);
        assert_eq!(dashboard.entries, 2);
        assert_eq!(dashboard.exits, 1);
        assert_eq!(
            dashboard.on_board,
            vec![
                VesselOccupancy { vessel_id: "v-1".into(), people: 1 },
                VesselOccupancy { vessel_id: "v-2".into(), people: 1 },
            ]
        );
        let auth_ids: Vec<_> = dashboard
            .expiring_authorizations
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(auth_ids, ["a-1"]);
        assert_eq!(dashboard.expiring_documents.len(), 1);
        assert_eq!(
            dashboard.expiring_documents[0].owner_id.as_deref(),
            Some("u-1")
        );
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quay.db");
        {
            let store = SqliteStore::open(&path).expect("open");
            store
                .insert(EntityKind::Company, record(json!({"id": "c-1", "name": "Acme"})))
                .await
                .expect("insert");
        }
        let reopened = SqliteStore::open(&path).expect("reopen");
        assert_eq!(reopened.count(EntityKind::Company).await.expect("count"), 1);
        reopened.ping().await.expect("ping");
    }
}
