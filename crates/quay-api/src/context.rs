//! Request context extraction and authentication middleware.
//!
//! In debug mode the caller is supplied via `X-User-Id` and `X-Roles` headers
//! for local development. In production mode the caller is extracted from a
//! verified JWT: the subject claim (default `sub`) is required, the roles
//! claim (default `roles`) is optional and may be an array or a comma string.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, State};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use ulid::Ulid;

use crate::config::JwtConfig;
use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Role allowed to run operator endpoints such as reconciliation.
pub const ADMIN_ROLE: &str = "admin";

/// Per-request context derived from authentication and headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller identifier (user, portal or service account).
    pub subject: String,
    /// Roles granted to the caller.
    pub roles: Vec<String>,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

impl RequestContext {
    /// Returns true if the caller holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Fails with 403 unless the caller is an admin.
    ///
    /// # Errors
    ///
    /// Returns `FORBIDDEN` when the admin role is missing.
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.has_role(ADMIN_ROLE) {
            Ok(())
        } else {
            Err(self.error(ApiError::forbidden("admin role required")))
        }
    }

    /// Attaches this request's id to an error.
    pub fn error(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().with_request_id(self.request_id.clone())
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let headers = &parts.headers;
        let request_id =
            request_id_from_headers(headers).unwrap_or_else(|| Ulid::new().to_string());

        let (subject, roles) = if state.config.debug {
            let subject = header_string(headers, "X-User-Id").ok_or_else(|| {
                ApiError::unauthorized("missing X-User-Id header (debug mode)")
                    .with_request_id(request_id.clone())
            })?;
            let roles = header_string(headers, "X-Roles")
                .map(|raw| split_roles(&raw))
                .unwrap_or_default();
            (subject, roles)
        } else {
            extract_from_jwt(headers, &state.config.jwt)
                .map_err(|err| err.with_request_id(request_id.clone()))?
        };

        let ctx = Self {
            subject,
            roles,
            request_id,
        };
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn extract_from_jwt(headers: &HeaderMap, jwt: &JwtConfig) -> Result<(String, Vec<String>), ApiError> {
    let token = bearer_token(headers).ok_or_else(ApiError::invalid_token)?;

    let (decoding_key, algorithm) = jwt_decoding_key(jwt)?;
    let mut validation = Validation::new(algorithm);
    validation.validate_nbf = true;
    if let Some(iss) = jwt.issuer.as_deref() {
        validation.set_issuer(&[iss]);
    }
    if let Some(aud) = jwt.audience.as_deref() {
        validation.set_audience(&[aud]);
    }

    let data = jsonwebtoken::decode::<Value>(&token, &decoding_key, &validation)
        .map_err(|e| {
            tracing::debug!(error = %e, "bearer token rejected");
            ApiError::invalid_token()
        })?;
    let Some(claims) = data.claims.as_object() else {
        return Err(ApiError::invalid_token());
    };

    let subject = claims
        .get(&jwt.subject_claim)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(ApiError::invalid_token)?;

    let roles = match claims.get(&jwt.roles_claim) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(raw)) => split_roles(raw),
        _ => Vec::new(),
    };

    Ok((subject, roles))
}

fn jwt_decoding_key(jwt: &JwtConfig) -> Result<(DecodingKey, Algorithm), ApiError> {
    match (
        jwt.hs256_secret.as_deref(),
        jwt.rs256_public_key_pem.as_deref(),
    ) {
        (Some(secret), None) => Ok((DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)),
        (None, Some(pem)) => DecodingKey::from_rsa_pem(pem.as_bytes())
            .map(|key| (key, Algorithm::RS256))
            .map_err(|e| ApiError::internal(format!("failed to parse jwt.rs256_public_key_pem: {e}"))),
        (Some(_), Some(_)) => Err(ApiError::internal(
            "jwt.hs256_secret and jwt.rs256_public_key_pem are mutually exclusive",
        )),
        (None, None) => Err(ApiError::internal(
            "jwt.hs256_secret or jwt.rs256_public_key_pem is required when debug=false",
        )),
    }
}

fn split_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, REQUEST_ID_HEADER)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "Authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Ensures every request carries an `x-request-id` and echoes it back.
///
/// Applied to the whole router so unauthenticated endpoints and auth
/// failures are correlated too.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers(req.headers()).unwrap_or_else(|| Ulid::new().to_string());
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = value.clone() {
        req.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    let mut response = next.run(req).await;
    if let Some(value) = value {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Authentication middleware.
///
/// This runs before rate limiting and injects a verified [`RequestContext`]
/// into request extensions.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::debug!(path = %parts.uri.path(), error = %err.message(), "authentication failed");
            return err.into_response();
        }
    };

    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// JSON body extractor whose rejections use the API error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id_from_headers(req.headers());
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => {
                let err = ApiError::from(rejection);
                Err(match request_id {
                    Some(id) => err.with_request_id(id),
                    None => err,
                })
            }
        }
    }
}
