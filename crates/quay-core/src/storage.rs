//! Object storage abstraction backing the document mirror.
//!
//! Whole-object reads, conditional writes, prefix listing and metadata.
//! The document store builds its merge-upsert on conditional writes.
//!
//! The version token is an opaque `String`; backends decide how to encode it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Guard checked atomically with a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// The object must be absent.
    DoesNotExist,
    /// The object must still be at this version.
    MatchesVersion(String),
    /// Always write.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The write landed.
    Success {
        /// Version of the object just written.
        version: String,
    },
    /// Someone else got there first.
    PreconditionFailed {
        /// Version found in place of the expected one.
        current_version: String,
    },
}

/// What `head` and `list` report about an object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key.
    pub path: String,
    /// Length in bytes.
    pub size: u64,
    /// Token to pass back in `WritePrecondition::MatchesVersion`.
    pub version: String,
    /// When the object was last written, if the backend tracks it.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Whole-object storage with compare-and-swap writes.
///
/// A failed precondition is an `Ok(WriteResult::PreconditionFailed)`, never
/// an `Err`; errors are reserved for the backend itself misbehaving.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an object. Missing objects are `Error::NotFound`.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object if `precondition` holds.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Removes an object; removing a missing object succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Metadata for every object under `prefix`, unordered.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Metadata for one object, `None` when absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// Process-local [`StorageBackend`].
///
/// Each object carries a counter that starts at 1 and is bumped on every
/// write; its decimal form is the version token.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, Slot>>>,
}

#[derive(Debug, Clone)]
struct Slot {
    data: Bytes,
    version: u64,
    written_at: DateTime<Utc>,
}

impl Slot {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_owned(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.written_at),
        }
    }
}

/// Returns the current version when `precondition` rejects a write over
/// `current`.
fn rejection(current: Option<u64>, precondition: &WritePrecondition) -> Option<String> {
    match (precondition, current) {
        (WritePrecondition::None, _) | (WritePrecondition::DoesNotExist, None) => None,
        (WritePrecondition::DoesNotExist, Some(version)) => Some(version.to_string()),
        (WritePrecondition::MatchesVersion(_), None) => Some("0".to_owned()),
        (WritePrecondition::MatchesVersion(expected), Some(version)) => {
            (expected.parse::<u64>().ok() != Some(version)).then(|| version.to_string())
        }
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Slot>>> {
        self.objects.read().map_err(|_| Error::Internal {
            message: "memory backend lock poisoned".into(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Slot>>> {
        self.objects.write().map_err(|_| Error::Internal {
            message: "memory backend lock poisoned".into(),
        })
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.read()?
            .get(path)
            .map(|slot| slot.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.write()?;
        let current = objects.get(path).map(|slot| slot.version);
        if let Some(current_version) = rejection(current, &precondition) {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let version = current.unwrap_or(0) + 1;
        objects.insert(
            path.to_owned(),
            Slot {
                data,
                version,
                written_at: Utc::now(),
            },
        );
        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.write()?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .read()?
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, slot)| slot.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.read()?.get(path).map(|slot| slot.meta(path)))
    }
}
