//! Single-record CRUD with dual writes.
//!
//! The relational store is written first and is the source of truth. The
//! document store is then updated best-effort: a failed mirror write is
//! logged and counted, and the request still succeeds.

use std::sync::Arc;

use quay_core::{EntityKind, Fields, Record, RecordId};

use crate::document::DocumentStore;
use crate::error::{Result, StoreError};
use crate::metrics::record_mirror_failure;
use crate::relational::{list_all, ListQuery, Page, RelationalStore, StoredRecord};
use crate::sync::mirror_one;

/// CRUD access to every entity kind.
#[derive(Clone)]
pub struct Repository {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    /// Creates a repository over both stores.
    #[must_use]
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
        }
    }

    /// Returns the relational store.
    #[must_use]
    pub fn relational(&self) -> &Arc<dyn RelationalStore> {
        &self.relational
    }

    /// Returns the document store.
    #[must_use]
    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// Creates a record, generating an id when the body has none.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on validation failure and `AlreadyExists` if the id is taken.
    pub async fn create(&self, kind: EntityKind, mut body: Fields) -> Result<StoredRecord> {
        let id = match body.get("id") {
            Some(value) => RecordId::from_json(value)?,
            None => RecordId::generate(),
        };
        kind.validate_create(&mut body)?;

        let record = Record::with_id(id, body);
        let stored = self.relational.insert(kind, record.clone()).await?;
        mirror_one(self.documents.as_ref(), kind, &record).await;

        tracing::info!(collection = kind.collection(), id = %record.id(), "record created");
        Ok(stored)
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist.
    pub async fn get(&self, kind: EntityKind, id: &RecordId) -> Result<StoredRecord> {
        self.relational
            .get(kind, id)
            .await?
            .ok_or_else(|| StoreError::not_found(kind, id.as_str()))
    }

    /// Lists records.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed query.
    pub async fn list(&self, kind: EntityKind, query: &ListQuery) -> Result<Page> {
        self.relational.list(kind, query).await
    }

    /// Shallow-merges `patch` into a record.
    ///
    /// The `id` field may be omitted or repeat the record id; it cannot change.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on validation failure and `NotFound` if the record is missing.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &RecordId,
        mut patch: Fields,
    ) -> Result<StoredRecord> {
        if let Some(value) = patch.remove("id") {
            if RecordId::from_json(&value)? != *id {
                return Err(StoreError::invalid("field 'id' cannot be changed"));
            }
        }
        kind.validate_patch(&mut patch)?;

        let stored = self.relational.update(kind, id, patch).await?;
        let record = Record::with_id(id.clone(), stored.body.clone());
        mirror_one(self.documents.as_ref(), kind, &record).await;

        tracing::info!(collection = kind.collection(), id = %id, "record updated");
        Ok(stored)
    }

    /// Deletes a record and its document.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record does not exist.
    pub async fn delete(&self, kind: EntityKind, id: &RecordId) -> Result<()> {
        if !self.relational.delete(kind, id).await? {
            return Err(StoreError::not_found(kind, id.as_str()));
        }
        if let Err(err) = self.documents.delete(kind, id).await {
            record_mirror_failure(kind.collection());
            tracing::warn!(collection = kind.collection(), id = %id, error = %err, "document delete failed");
        }
        tracing::info!(collection = kind.collection(), id = %id, "record deleted");
        Ok(())
    }

    /// Lists portals or beacons placed in an area.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the area does not exist, `InvalidInput` if
    /// `member` has no `areaId` field.
    pub async fn area_members(
        &self,
        area: &RecordId,
        member: EntityKind,
    ) -> Result<Vec<StoredRecord>> {
        if !member.rules().iter().any(|rule| rule.name == "areaId") {
            return Err(StoreError::invalid(format!(
                "{member} records are not placed in areas"
            )));
        }
        self.get(EntityKind::Area, area).await?;
        list_all(
            self.relational.as_ref(),
            member,
            ListQuery::new().with_filter("areaId", area.as_str()),
        )
        .await
    }
}
