//! An object-storage backend that records what the document store does.
//!
//! Wraps [`MemoryBackend`]. Tests can fail every call under a prefix, or make
//! conditional writes lose a race against a simulated second writer to drive
//! the document store's compare-and-swap retry loop.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quay_core::error::{Error, Result};
use quay_core::storage::{
    MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Object read.
    Get(String),
    /// Metadata read.
    Head(String),
    /// Object write.
    Put {
        /// Object path.
        path: String,
        /// Bytes written.
        size: usize,
        /// Whether the write carried a precondition.
        conditional: bool,
    },
    /// Object removal.
    Delete(String),
    /// Prefix listing.
    List(String),
}

impl StorageOp {
    fn path(&self) -> &str {
        match self {
            Self::Get(path)
            | Self::Head(path)
            | Self::Delete(path)
            | Self::List(path)
            | Self::Put { path, .. } => path,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_prefixes: Vec<String>,
    race_prefix: String,
    races_left: usize,
}

/// In-memory storage backend with operation recording and fault injection.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    ops: Arc<Mutex<Vec<StorageOp>>>,
    faults: Arc<Mutex<Faults>>,
}

impl TracingMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded call, oldest first.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.ops.lock().expect("lock").clone()
    }

    /// Counts conditional writes under `prefix`, including lost races.
    #[must_use]
    pub fn conditional_puts_under(&self, prefix: &str) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, StorageOp::Put { conditional: true, .. }))
            .filter(|op| op.path().starts_with(prefix))
            .count()
    }

    /// Fails every call whose path starts with `prefix`.
    pub fn fail_prefix(&self, prefix: impl Into<String>) {
        self.faults
            .lock()
            .expect("lock")
            .failing_prefixes
            .push(prefix.into());
    }

    /// Makes the next `times` conditional writes under `prefix` lose a race:
    /// another writer rewrites the object just before each write lands.
    pub fn interfere_with_puts(&self, prefix: impl Into<String>, times: usize) {
        let mut faults = self.faults.lock().expect("lock");
        faults.race_prefix = prefix.into();
        faults.races_left = times;
    }

    fn enter(&self, op: StorageOp) -> Result<()> {
        let failing = self
            .faults
            .lock()
            .expect("lock")
            .failing_prefixes
            .iter()
            .any(|prefix| op.path().starts_with(prefix.as_str()));
        if failing {
            return Err(Error::storage(format!("injected failure for path: {}", op.path())));
        }
        self.ops.lock().expect("lock").push(op);
        Ok(())
    }

    fn lose_race(&self, path: &str) -> bool {
        let mut faults = self.faults.lock().expect("lock");
        if faults.races_left > 0 && path.starts_with(faults.race_prefix.as_str()) {
            faults.races_left -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.enter(StorageOp::Get(path.to_string()))?;
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let conditional = !matches!(precondition, WritePrecondition::None);
        self.enter(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            conditional,
        })?;

        if conditional && self.lose_race(path) {
            let current = match self.inner.get(path).await {
                Ok(bytes) => bytes,
                Err(Error::NotFound(_)) => Bytes::from_static(b"{}"),
                Err(e) => return Err(e),
            };
            self.inner
                .put(path, current, WritePrecondition::None)
                .await?;
        }

        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.enter(StorageOp::Delete(path.to_string()))?;
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.enter(StorageOp::List(prefix.to_string()))?;
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.enter(StorageOp::Head(path.to_string()))?;
        self.inner.head(path).await
    }
}
