//! Logging setup and the spans shared by the store and the API, so sync and
//! CRUD logs carry the same field names.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Multi-line human output.
    #[default]
    Pretty,
}

/// Installs the global `tracing` subscriber, filtered by `RUST_LOG`.
///
/// Only the first call has an effect.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let output = match format {
            LogFormat::Json => fmt::layer().json().boxed(),
            LogFormat::Pretty => fmt::layer().pretty().boxed(),
        };
        tracing_subscriber::registry().with(filter).with(output).init();
    });
}

/// Creates a span for a batched sync request.
///
/// # Example
///
/// ```rust
/// use quay_core::observability::sync_span;
///
/// let span = sync_span("Event", 250, "01J9ZQ4Y7W3D1B2C3D4E5F6G7H");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn sync_span(entity: &str, records: usize, request_id: &str) -> Span {
    tracing::info_span!(
        "sync",
        entity = entity,
        records = records,
        request_id = request_id,
    )
}

/// Creates a span for a single-record CRUD operation.
#[must_use]
pub fn record_span(operation: &str, collection: &str, id: &str) -> Span {
    tracing::info_span!("record", op = operation, collection = collection, id = id)
}
