//! Batched sync routes for edge devices.
//!
//! ## Routes
//!
//! - `POST /sync` - Upsert records of one syncable entity
//! - `POST /sync/events` - Upsert entry/exit events (capped per request)
//!
//! Records are written in fixed-size batches; each batch is one relational
//! transaction followed by a merge-upsert of every record into the document
//! store. Resending the same records is harmless.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use utoipa::ToSchema;

use quay_core::observability::sync_span;
use quay_core::EntityKind;
use quay_store::{BatchReport, SyncReport};

use crate::context::{ApiJson, RequestContext};
use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

/// Request to synchronize records of one entity.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SyncRequest {
    /// Entity name, e.g. `Event` or `Vessel` (case-insensitive).
    pub entity: String,
    /// Records to upsert; each needs an `id`.
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<Value>,
}

/// Request to synchronize events.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EventSyncRequest {
    /// Event records to upsert; each needs an `id`.
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<Value>,
}

/// Outcome of one committed batch.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Zero-based batch position.
    pub index: usize,
    /// Records in the batch.
    pub records: usize,
    /// Rows created.
    pub inserted: usize,
    /// Rows whose body changed.
    pub updated: usize,
    /// Rows already up to date.
    pub unchanged: usize,
    /// Documents merged.
    pub mirrored: usize,
    /// Document writes that failed.
    pub mirror_failures: usize,
}

impl From<BatchReport> for BatchResponse {
    fn from(batch: BatchReport) -> Self {
        Self {
            index: batch.index,
            records: batch.records,
            inserted: batch.write.inserted,
            updated: batch.write.updated,
            unchanged: batch.write.unchanged,
            mirrored: batch.mirrored,
            mirror_failures: batch.mirror_failures,
        }
    }
}

/// Sync response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Canonical entity name.
    pub entity: String,
    /// Records received.
    pub received: usize,
    /// Per-batch outcomes in commit order.
    pub batches: Vec<BatchResponse>,
    /// Documents merged across all batches.
    pub mirrored: usize,
    /// Document writes that failed across all batches.
    pub mirror_failures: usize,
}

impl From<SyncReport> for SyncResponse {
    fn from(report: SyncReport) -> Self {
        Self {
            entity: report.entity.name().to_string(),
            received: report.received,
            batches: report.batches.into_iter().map(BatchResponse::from).collect(),
            mirrored: report.mirrored,
            mirror_failures: report.mirror_failures,
        }
    }
}

/// Creates sync routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync", post(sync_records))
        .route("/sync/events", post(sync_events))
}

fn log_report(ctx: &RequestContext, report: &SyncReport) {
    if report.mirror_failures > 0 {
        tracing::warn!(
            subject = %ctx.subject,
            entity = report.entity.name(),
            received = report.received,
            mirror_failures = report.mirror_failures,
            "sync committed with document mirror failures"
        );
    } else {
        tracing::info!(
            subject = %ctx.subject,
            entity = report.entity.name(),
            received = report.received,
            batches = report.batches.len(),
            "sync committed"
        );
    }
}

/// Synchronize records of one entity.
///
/// POST /api/v1/sync
#[utoipa::path(
    post,
    path = "/api/v1/sync",
    tag = "sync",
    request_body = SyncRequest,
    responses(
        (status = 200, description = "All batches committed", body = SyncResponse),
        (status = 400, description = "Unknown entity or invalid record; nothing written", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = ApiErrorBody),
        (status = 500, description = "A batch failed; earlier batches stay committed", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn sync_records(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let span = sync_span(&req.entity, req.records.len(), &ctx.request_id);
    let report = state
        .sync()
        .sync(&req.entity, req.records)
        .instrument(span)
        .await
        .map_err(|e| ctx.error(e))?;

    log_report(&ctx, &report);
    Ok(Json(SyncResponse::from(report)))
}

/// Synchronize entry/exit events.
///
/// POST /api/v1/sync/events
///
/// Requests above the configured cap are rejected before anything is written.
#[utoipa::path(
    post,
    path = "/api/v1/sync/events",
    tag = "sync",
    request_body = EventSyncRequest,
    responses(
        (status = 200, description = "All batches committed", body = SyncResponse),
        (status = 400, description = "Invalid record; nothing written", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 413, description = "Too many records; nothing written", body = ApiErrorBody),
        (status = 429, description = "Rate limited", body = ApiErrorBody),
        (status = 500, description = "A batch failed; earlier batches stay committed", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn sync_events(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<EventSyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let span = sync_span(EntityKind::Event.name(), req.records.len(), &ctx.request_id);
    let report = state
        .sync()
        .sync_events(req.records)
        .instrument(span)
        .await
        .map_err(|e| ctx.error(e))?;

    log_report(&ctx, &report);
    Ok(Json(SyncResponse::from(report)))
}
