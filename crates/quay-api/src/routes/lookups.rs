//! Read-side lookups: area membership, boarding checks and the dashboard.
//!
//! ## Routes
//!
//! - `GET  /areas/{id}/portals` - Portals placed in an area
//! - `GET  /areas/{id}/beacons` - Beacons placed in an area
//! - `POST /access/check` - May a user board a vessel at an instant?
//! - `GET  /dashboard` - Aggregated operational view

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use quay_core::{format_timestamp, parse_timestamp, EntityKind};
use quay_store::{check_access, AccessReason, Dashboard, DashboardWindow, ExpiringRecord};

use crate::context::{ApiJson, RequestContext};
use crate::error::{ApiError, ApiErrorBody};
use crate::routes::entities::{parse_id, ListRecordsResponse};
use crate::server::AppState;

const DEFAULT_WINDOW_HOURS: i64 = 24;
const MAX_WINDOW_HOURS: i64 = 720;
const DEFAULT_HORIZON_DAYS: i64 = 30;
const MAX_HORIZON_DAYS: i64 = 365;

/// Boarding check request.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckRequest {
    /// User asking to board.
    pub user_id: String,
    /// Vessel being boarded.
    pub vessel_id: String,
    /// Instant to check (RFC 3339); defaults to now.
    pub at: Option<String>,
}

/// Boarding check result.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckResponse {
    /// Whether boarding is allowed.
    pub allowed: bool,
    /// `authorized`, `unknown_user` or `no_valid_authorization`.
    pub reason: String,
    /// Authorization that allowed boarding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<String>,
    /// Instant that was checked (RFC 3339).
    pub at: String,
}

/// Occupancy of one vessel.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyResponse {
    /// Vessel identifier.
    pub vessel_id: String,
    /// People currently on board.
    pub people: u64,
}

/// A record expiring soon.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringResponse {
    /// Record identifier.
    pub id: String,
    /// Owning user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Expiry instant.
    pub expires_at: String,
}

impl From<ExpiringRecord> for ExpiringResponse {
    fn from(record: ExpiringRecord) -> Self {
        Self {
            id: record.id,
            owner_id: record.owner_id,
            expires_at: record.expires_at,
        }
    }
}

/// Dashboard response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardResponse {
    /// Reference instant.
    pub generated_at: String,
    /// Start of the event window.
    pub window_start: String,
    /// End of the expiry horizon.
    pub horizon_end: String,
    /// Record count per collection.
    pub totals: BTreeMap<String, u64>,
    /// Entries inside the window.
    pub entries: u64,
    /// Exits inside the window.
    pub exits: u64,
    /// People on board per vessel.
    pub on_board: Vec<OccupancyResponse>,
    /// Authorizations ending inside the horizon.
    pub expiring_authorizations: Vec<ExpiringResponse>,
    /// Documents expiring inside the horizon.
    pub expiring_documents: Vec<ExpiringResponse>,
}

impl From<Dashboard> for DashboardResponse {
    fn from(dashboard: Dashboard) -> Self {
        Self {
            generated_at: format_timestamp(dashboard.generated_at),
            window_start: format_timestamp(dashboard.window_start),
            horizon_end: format_timestamp(dashboard.horizon_end),
            totals: dashboard.totals,
            entries: dashboard.entries,
            exits: dashboard.exits,
            on_board: dashboard
                .on_board
                .into_iter()
                .map(|o| OccupancyResponse {
                    vessel_id: o.vessel_id,
                    people: o.people,
                })
                .collect(),
            expiring_authorizations: dashboard
                .expiring_authorizations
                .into_iter()
                .map(ExpiringResponse::from)
                .collect(),
            expiring_documents: dashboard
                .expiring_documents
                .into_iter()
                .map(ExpiringResponse::from)
                .collect(),
        }
    }
}

/// Creates lookup routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/areas/:id/portals", get(area_portals))
        .route("/areas/:id/beacons", get(area_beacons))
        .route("/access/check", post(access_check))
        .route("/dashboard", get(dashboard))
}

async fn area_members(
    ctx: &RequestContext,
    state: &AppState,
    area: &str,
    member: EntityKind,
) -> Result<ListRecordsResponse, ApiError> {
    let area = parse_id(ctx, area)?;
    let records = state
        .repository()
        .area_members(&area, member)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(ListRecordsResponse::unpaged(records))
}

/// List portals in an area.
///
/// GET /api/v1/areas/{id}/portals
#[utoipa::path(
    get,
    path = "/api/v1/areas/{id}/portals",
    tag = "lookups",
    params(("id" = String, Path, description = "Area id")),
    responses(
        (status = 200, description = "Portals in the area", body = ListRecordsResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Area not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn area_portals(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(area_members(&ctx, &state, &id, EntityKind::Portal).await?))
}

/// List beacons in an area.
///
/// GET /api/v1/areas/{id}/beacons
#[utoipa::path(
    get,
    path = "/api/v1/areas/{id}/beacons",
    tag = "lookups",
    params(("id" = String, Path, description = "Area id")),
    responses(
        (status = 200, description = "Beacons in the area", body = ListRecordsResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Area not found", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn area_beacons(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(area_members(&ctx, &state, &id, EntityKind::Beacon).await?))
}

/// Decide whether a user may board a vessel.
///
/// POST /api/v1/access/check
#[utoipa::path(
    post,
    path = "/api/v1/access/check",
    tag = "lookups",
    request_body = AccessCheckRequest,
    responses(
        (status = 200, description = "Decision", body = AccessCheckResponse),
        (status = 400, description = "Bad id or timestamp", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn access_check(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<AccessCheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = parse_id(&ctx, &req.user_id)?;
    let vessel = parse_id(&ctx, &req.vessel_id)?;
    let at = match req.at.as_deref() {
        Some(raw) => parse_timestamp(raw).ok_or_else(|| {
            ctx.error(ApiError::bad_request(format!("invalid timestamp '{raw}'")))
        })?,
        None => Utc::now(),
    };

    let decision = check_access(state.repository().relational().as_ref(), &user, &vessel, at)
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(
        subject = %ctx.subject,
        user = %user,
        vessel = %vessel,
        allowed = decision.allowed,
        "access checked"
    );

    Ok(Json(AccessCheckResponse {
        allowed: decision.allowed,
        reason: reason_code(decision.reason).to_string(),
        authorization_id: decision.authorization_id,
        at: format_timestamp(at),
    }))
}

const fn reason_code(reason: AccessReason) -> &'static str {
    match reason {
        AccessReason::Authorized => "authorized",
        AccessReason::UnknownUser => "unknown_user",
        AccessReason::NoValidAuthorization => "no_valid_authorization",
    }
}

fn bounded_param(
    ctx: &RequestContext,
    params: &HashMap<String, String>,
    name: &str,
    default: i64,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, ApiError> {
    let Some(raw) = params.get(name) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(value) if range.contains(&value) => Ok(value),
        _ => Err(ctx.error(ApiError::bad_request(format!(
            "{name} must be an integer between {} and {}",
            range.start(),
            range.end()
        )))),
    }
}

/// Aggregated operational view.
///
/// GET /api/v1/dashboard
#[utoipa::path(
    get,
    path = "/api/v1/dashboard",
    tag = "lookups",
    params(
        ("window_hours" = Option<i64>, Query, description = "Event lookback in hours (1-720, default 24)"),
        ("horizon_days" = Option<i64>, Query, description = "Expiry horizon in days (0-365, default 30)"),
    ),
    responses(
        (status = 200, description = "Dashboard", body = DashboardResponse),
        (status = 400, description = "Parameter out of range", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn dashboard(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let window_hours = bounded_param(
        &ctx,
        &params,
        "window_hours",
        DEFAULT_WINDOW_HOURS,
        1..=MAX_WINDOW_HOURS,
    )?;
    let horizon_days = bounded_param(
        &ctx,
        &params,
        "horizon_days",
        DEFAULT_HORIZON_DAYS,
        0..=MAX_HORIZON_DAYS,
    )?;

    let window = DashboardWindow {
        now: Utc::now(),
        lookback: Duration::hours(window_hours),
        horizon: Duration::days(horizon_days),
    };
    let dashboard = state
        .repository()
        .relational()
        .dashboard(&window)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(DashboardResponse::from(dashboard)))
}
