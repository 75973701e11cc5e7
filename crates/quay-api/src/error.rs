//! API error types and HTTP response mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::header::HeaderName;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use quay_core::Error as CoreError;
use quay_store::{StoreError, SyncError};

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
    /// Optional request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Structured details for errors that carry progress (failed sync batches).
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    request_id: Option<String>,
    retry_after_secs: Option<u64>,
    details: Option<Value>,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response when the bearer token is missing or invalid.
    #[must_use]
    pub fn invalid_token() -> Self {
        Self::unauthorized("missing or invalid bearer token")
    }

    /// Returns an error response for authorization failures.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an error response for conflict (already exists / CAS).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Returns an error response for requests over a size cap.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", message)
    }

    /// Returns an error response for rate-limited callers.
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "TOO_MANY_REQUESTS", message)
    }

    /// Returns an error response when a dependency is down or a request timed out.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            message,
        )
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Attaches a request ID for correlation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches a Retry-After header value in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the request ID, if one was attached.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: None,
            retry_after_secs: None,
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        }

        let request_id = self.request_id;
        let retry_after_secs = self.retry_after_secs;
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
                request_id: request_id.clone(),
                details: self.details,
            }),
        )
            .into_response();

        let headers = response.headers_mut();
        let extra = [
            ("x-request-id", request_id),
            ("retry-after", retry_after_secs.map(|secs| secs.to_string())),
        ];
        for (name, value) in extra {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        response
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::InvalidInput { message } => Self::bad_request(message),
            err @ StoreError::AlreadyExists { .. } => Self::conflict(err.to_string()),
            err @ StoreError::NotFound { .. } => Self::not_found(err.to_string()),
            StoreError::CasFailed { message } => Self::conflict(message),
            err @ (StoreError::Database { .. }
            | StoreError::Backend(_)
            | StoreError::Serialization { .. }
            | StoreError::Internal { .. }) => Self::internal(err.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        match value {
            err @ (SyncError::UnknownEntity { .. }
            | SyncError::NotSyncable { .. }
            | SyncError::InvalidRecord { .. }) => Self::bad_request(err.to_string()),
            err @ SyncError::TooManyRecords { .. } => Self::payload_too_large(err.to_string()),
            SyncError::BatchFailed {
                entity,
                batch_index,
                batches,
                committed_batches,
                committed_records,
                source,
            } => {
                let mut error = Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SYNC_BATCH_FAILED",
                    format!("sync of {entity} failed at batch {batch_index}: {source}"),
                );
                error.details = Some(json!({
                    "entity": entity,
                    "batchIndex": batch_index,
                    "batches": batches,
                    "committedBatches": committed_batches,
                    "committedRecords": committed_records,
                }));
                error
            }
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidId { message } | CoreError::InvalidInput(message) => {
                Self::bad_request(message)
            }
            err @ CoreError::UnknownEntity { .. } => Self::bad_request(err.to_string()),
            CoreError::NotFound(message) => Self::not_found(message),
            CoreError::Storage { message, .. }
            | CoreError::Serialization { message }
            | CoreError::Internal { message } => Self::internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        if value.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::payload_too_large(value.body_text())
        } else {
            Self::bad_request(value.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_core::EntityKind;

    #[test]
    fn rate_limited_error_carries_retry_after() {
        let error = ApiError::too_many_requests("slow down").with_retry_after(10);
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after = response
            .headers()
            .get("retry-after")
            .expect("retry-after");
        assert_eq!(retry_after, "10");
    }

    #[test]
    fn conflict_has_no_retry_after() {
        let response = ApiError::conflict("vessel v-1 already exists").into_response();
        assert!(response.headers().get("retry-after").is_none());
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::invalid("bad"), StatusCode::BAD_REQUEST),
            (
                StoreError::not_found(EntityKind::Vessel, "v-9"),
                StatusCode::NOT_FOUND,
            ),
            (
                StoreError::AlreadyExists {
                    entity: EntityKind::User,
                    id: "u-1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                StoreError::Database {
                    message: "disk full".into(),
                    source: None,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn sync_cap_maps_to_payload_too_large() {
        let err = ApiError::from(SyncError::TooManyRecords { count: 150, max: 100 });
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn batch_failure_reports_progress() {
        let err = ApiError::from(SyncError::BatchFailed {
            entity: EntityKind::Event,
            batch_index: 2,
            batches: 3,
            committed_batches: 2,
            committed_records: 200,
            source: StoreError::internal("boom"),
        });
        assert_eq!(err.code(), "SYNC_BATCH_FAILED");
        let details = err.details.as_ref().expect("details");
        assert_eq!(details["committedRecords"], 200);
        assert_eq!(details["batchIndex"], 2);
    }
}
