//! Entity CRUD routes.
//!
//! Every catalogue entity is exposed under its collection name. Writes go to
//! the relational store first and are then mirrored to the document store.
//!
//! ## Routes
//!
//! - `POST   /entities/{collection}` - Create a record
//! - `GET    /entities/{collection}` - List records (filters + pagination)
//! - `GET    /entities/{collection}/{id}` - Get a record
//! - `PATCH  /entities/{collection}/{id}` - Merge fields into a record
//! - `DELETE /entities/{collection}/{id}` - Delete a record

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;
use utoipa::ToSchema;

use quay_core::observability::record_span;
use quay_core::{format_timestamp, EntityKind, Fields, RecordId};
use quay_store::{ListQuery, StoredRecord};

use crate::context::{ApiJson, RequestContext};
use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

/// A stored record.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordResponse {
    /// Record identifier.
    pub id: String,
    /// Collection the record belongs to.
    pub collection: String,
    /// Full record body, including `id`.
    #[schema(value_type = Object)]
    pub body: Fields,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last change timestamp (RFC 3339).
    pub updated_at: String,
}

impl From<StoredRecord> for RecordResponse {
    fn from(record: StoredRecord) -> Self {
        Self {
            id: record.id,
            collection: record.collection,
            body: record.body,
            created_at: format_timestamp(record.created_at),
            updated_at: format_timestamp(record.updated_at),
        }
    }
}

/// A page of records.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListRecordsResponse {
    /// Records ordered by id.
    pub records: Vec<RecordResponse>,
    /// Pass as `page_token` to fetch the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl ListRecordsResponse {
    pub(crate) fn unpaged(records: Vec<StoredRecord>) -> Self {
        Self {
            records: records.into_iter().map(RecordResponse::from).collect(),
            next_page_token: None,
        }
    }
}

/// Creates entity routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/entities/:collection", post(create_record).get(list_records))
        .route(
            "/entities/:collection/:id",
            get(get_record).patch(update_record).delete(delete_record),
        )
}

pub(crate) fn resolve_collection(
    ctx: &RequestContext,
    collection: &str,
) -> Result<EntityKind, ApiError> {
    EntityKind::from_collection(collection)
        .ok_or_else(|| ctx.error(ApiError::not_found(format!("unknown collection '{collection}'"))))
}

pub(crate) fn parse_id(ctx: &RequestContext, id: &str) -> Result<RecordId, ApiError> {
    RecordId::new(id).map_err(|e| ctx.error(e))
}

fn into_fields(ctx: &RequestContext, body: Value) -> Result<Fields, ApiError> {
    match body {
        Value::Object(fields) => Ok(fields),
        _ => Err(ctx.error(ApiError::bad_request("request body must be a JSON object"))),
    }
}

fn list_query(
    ctx: &RequestContext,
    mut params: BTreeMap<String, String>,
) -> Result<ListQuery, ApiError> {
    let mut query = ListQuery::new();
    if let Some(raw) = params.remove("limit") {
        let limit = raw.parse::<usize>().map_err(|_| {
            ctx.error(ApiError::bad_request(format!("invalid limit '{raw}'")))
        })?;
        query = query.with_limit(limit);
    }
    if let Some(token) = params.remove("page_token") {
        query = query.with_page_token(token);
    }
    for (field, value) in params {
        query = query.with_filter(field, value);
    }
    Ok(query)
}

/// Create a record.
///
/// POST /api/v1/entities/{collection}
#[utoipa::path(
    post,
    path = "/api/v1/entities/{collection}",
    tag = "entities",
    params(("collection" = String, Path, description = "Collection name, e.g. `vessels`")),
    request_body(content = Object, description = "Record body; `id` is generated when omitted"),
    responses(
        (status = 201, description = "Record created", body = RecordResponse),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Unknown collection", body = ApiErrorBody),
        (status = 409, description = "Record already exists", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn create_record(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    ApiJson(body): ApiJson<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = resolve_collection(&ctx, &collection)?;
    let body = into_fields(&ctx, body)?;

    let record = state
        .repository()
        .create(kind, body)
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(
        subject = %ctx.subject,
        collection = %collection,
        id = %record.id,
        "created record"
    );
    Ok((StatusCode::CREATED, Json(RecordResponse::from(record))))
}

/// List records.
///
/// GET /api/v1/entities/{collection}
///
/// Query parameters other than `limit` and `page_token` are equality filters
/// on top-level fields.
#[utoipa::path(
    get,
    path = "/api/v1/entities/{collection}",
    tag = "entities",
    params(
        ("collection" = String, Path, description = "Collection name"),
        ("limit" = Option<usize>, Query, description = "Page size"),
        ("page_token" = Option<String>, Query, description = "Token from the previous page"),
    ),
    responses(
        (status = 200, description = "A page of records", body = ListRecordsResponse),
        (status = 400, description = "Bad filter or limit", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Unknown collection", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn list_records(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = resolve_collection(&ctx, &collection)?;
    let query = list_query(&ctx, params)?;

    let page = state
        .repository()
        .list(kind, &query)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(ListRecordsResponse {
        records: page.records.into_iter().map(RecordResponse::from).collect(),
        next_page_token: page.next_page_token,
    }))
}

/// Get a record.
///
/// GET /api/v1/entities/{collection}/{id}
#[utoipa::path(
    get,
    path = "/api/v1/entities/{collection}/{id}",
    tag = "entities",
    params(
        ("collection" = String, Path, description = "Collection name"),
        ("id" = String, Path, description = "Record id"),
    ),
    responses(
        (status = 200, description = "Record found", body = RecordResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn get_record(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = resolve_collection(&ctx, &collection)?;
    let id = parse_id(&ctx, &id)?;

    let record = state
        .repository()
        .get(kind, &id)
        .instrument(record_span("get", kind.collection(), id.as_str()))
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(RecordResponse::from(record)))
}

/// Merge fields into a record.
///
/// PATCH /api/v1/entities/{collection}/{id}
#[utoipa::path(
    patch,
    path = "/api/v1/entities/{collection}/{id}",
    tag = "entities",
    params(
        ("collection" = String, Path, description = "Collection name"),
        ("id" = String, Path, description = "Record id"),
    ),
    request_body(content = Object, description = "Top-level fields to replace"),
    responses(
        (status = 200, description = "Record updated", body = RecordResponse),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn update_record(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    ApiJson(body): ApiJson<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = resolve_collection(&ctx, &collection)?;
    let id = parse_id(&ctx, &id)?;
    let patch = into_fields(&ctx, body)?;

    let record = state
        .repository()
        .update(kind, &id, patch)
        .instrument(record_span("update", kind.collection(), id.as_str()))
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(RecordResponse::from(record)))
}

/// Delete a record.
///
/// DELETE /api/v1/entities/{collection}/{id}
#[utoipa::path(
    delete,
    path = "/api/v1/entities/{collection}/{id}",
    tag = "entities",
    params(
        ("collection" = String, Path, description = "Collection name"),
        ("id" = String, Path, description = "Record id"),
    ),
    responses(
        (status = 204, description = "Record deleted"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn delete_record(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = resolve_collection(&ctx, &collection)?;
    let id = parse_id(&ctx, &id)?;

    state
        .repository()
        .delete(kind, &id)
        .instrument(record_span("delete", kind.collection(), id.as_str()))
        .await
        .map_err(|e| ctx.error(e))?;

    tracing::info!(subject = %ctx.subject, collection = %collection, id = %id, "deleted record");
    Ok(StatusCode::NO_CONTENT)
}
