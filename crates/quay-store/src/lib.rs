//! # quay-store
//!
//! Persistence for the Quay backend: the relational store (source of truth),
//! the document mirror, and the batched sync protocol that writes both.
//!
//! ## Modules
//!
//! - [`relational`]: the [`RelationalStore`] contract and its `SQLite` implementation
//! - [`document`]: the [`DocumentStore`] contract over object storage or `SQLite`
//! - [`sync`]: the [`SyncEngine`] applying edge-device batches to both stores
//! - [`repository`]: single-record CRUD with dual writes
//! - [`access`]: boarding decisions from authorizations
//! - [`reconciler`]: drift detection and repair between the two stores
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use quay_core::MemoryBackend;
//! use quay_store::{ObjectDocumentStore, SqliteStore, SyncEngine};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::new(
//!     Arc::new(SqliteStore::open_in_memory()?),
//!     Arc::new(ObjectDocumentStore::new(Arc::new(MemoryBackend::new()))),
//! );
//! let report = engine
//!     .sync("Event", vec![json!({"id": "evt-1", "kind": "entry"})])
//!     .await?;
//! assert_eq!(report.batches.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod access;
pub mod document;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod relational;
pub mod repository;
mod sqlite;
pub mod sync;

pub use access::{check_access, AccessDecision, AccessReason};
pub use document::{DocumentStore, MergeOutcome, ObjectDocumentStore, SqliteDocumentStore};
pub use error::{Result, StoreError};
pub use reconciler::{IssueType, ReconciliationIssue, ReconciliationReport, Reconciler, RepairResult};
pub use relational::{
    list_all, BatchWrite, Dashboard, DashboardWindow, ExpiringRecord, ListQuery, Page,
    RelationalStore, SqliteStore, StoredRecord, VesselOccupancy,
};
pub use repository::Repository;
pub use sync::{BatchReport, SyncEngine, SyncError, SyncLimits, SyncReport};
