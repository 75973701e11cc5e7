//! Shared test utilities for Quay integration tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory object storage with operation recording
//! - [`RecordingRelationalStore`] and [`RecordingDocumentStore`]: store
//!   wrappers that count writes and inject failures
//! - [`TestStores`] and record factories for common scenarios
//!
//! # Example
//!
//! ```rust,ignore
//! use quay_test_utils::{event_records, TestStores};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let stores = TestStores::new();
//!     stores.sync.sync_events(event_records(10)).await.unwrap();
//!     assert_eq!(stores.relational.committed_batches(), [10]);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;
pub mod stores;

pub use fixtures::*;
pub use storage::*;
pub use stores::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("quay_store=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
