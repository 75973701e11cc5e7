//! Operator route for detecting and repairing drift between the stores.
//!
//! `POST /reconcile/{collection}` compares every row with its document and
//! reports missing, divergent and orphaned documents. With `?repair=true`
//! the repairable issues are fixed from the relational store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use quay_store::{ReconciliationReport, RepairResult};

use crate::config::parse_bool;
use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody};
use crate::routes::entities::resolve_collection;
use crate::server::AppState;

/// Reconciliation response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    /// Issues found before any repair.
    #[schema(value_type = Object)]
    pub report: ReconciliationReport,
    /// Repair outcome, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub repair: Option<RepairResult>,
}

/// Creates reconcile routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/reconcile/:collection", post(reconcile))
}

/// Check (and optionally repair) one collection.
///
/// POST /api/v1/reconcile/{collection}
#[utoipa::path(
    post,
    path = "/api/v1/reconcile/{collection}",
    tag = "reconcile",
    params(
        ("collection" = String, Path, description = "Collection name"),
        ("repair" = Option<bool>, Query, description = "Fix repairable issues"),
    ),
    responses(
        (status = 200, description = "Reconciliation report", body = ReconcileResponse),
        (status = 400, description = "Bad parameter", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Admin role required", body = ApiErrorBody),
        (status = 404, description = "Unknown collection", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn reconcile(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.require_admin()?;
    let kind = resolve_collection(&ctx, &collection)?;
    let repair = match params.get("repair") {
        Some(raw) => parse_bool("repair", raw).map_err(|e| ctx.error(e))?,
        None => false,
    };

    let report = state
        .reconciler()
        .check(kind)
        .await
        .map_err(|e| ctx.error(e))?;
    tracing::info!(
        subject = %ctx.subject,
        collection = %collection,
        issues = report.issues.len(),
        "reconciliation check finished"
    );

    let repair = if repair && report.has_issues() {
        Some(
            state
                .reconciler()
                .repair(&report)
                .await
                .map_err(|e| ctx.error(e))?,
        )
    } else {
        None
    };

    Ok(Json(ReconcileResponse { report, repair }))
}
