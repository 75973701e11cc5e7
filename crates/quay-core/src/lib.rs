//! # quay-core
//!
//! Shared primitives for the Quay vessel and port access-control backend.
//!
//! - **Entities**: the catalogue of entity kinds, their collections and field rules
//! - **Records**: validated identifiers and schemaless JSON bodies
//! - **Storage**: the object-storage contract the document mirror is built on
//! - **Errors**: the shared error type and result alias
//!
//! ## Example
//!
//! ```rust
//! use quay_core::prelude::*;
//!
//! let kind: EntityKind = "event".parse().unwrap();
//! assert_eq!(kind.collection(), "events");
//! assert!(kind.is_syncable());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod entity;
pub mod error;
pub mod observability;
pub mod record;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::entity::EntityKind;
    pub use crate::error::{Error, Result};
    pub use crate::record::{Fields, Record, RecordId};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use entity::{format_timestamp, parse_timestamp, EntityKind, FieldRule, FieldType};
pub use error::{Error, Result};
pub use observability::{init_logging, LogFormat};
pub use record::{shallow_merge, Fields, Record, RecordId};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
