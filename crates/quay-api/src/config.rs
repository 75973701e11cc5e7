//! Server configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use quay_core::{Error, Result};
use quay_store::document::DEFAULT_MAX_CAS_RETRIES;
use quay_store::sync::{DEFAULT_BATCH_SIZE, DEFAULT_EVENT_SYNC_MAX_RECORDS};
use quay_store::SyncLimits;

use crate::rate_limit::RateLimitConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP port to listen on.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - `RequestContext` is taken from `X-User-Id` / `X-Roles` headers (dev/tests)
    /// - in-memory stores are allowed
    ///
    /// When disabled:
    /// - `Authorization` is required (JWT claim extraction + signature verification)
    pub debug: bool,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// JWT authentication configuration (used when `debug` is false).
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Database locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sync batching and caps.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Per-request timeout in seconds; requests past it get 503.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Maximum in-flight requests.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            cors: CorsConfig::default(),
            jwt: JwtConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            request_timeout_secs: None,
            concurrency_limit: None,
        }
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Use `["*"]` to allow all origins (debug only).
    /// Empty list disables CORS entirely.
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache (seconds).
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 3600,
        }
    }
}

/// Database locations. Unset paths mean in-memory stores (debug only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` file for the relational store.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// `SQLite` file for the document store.
    #[serde(default)]
    pub document_db_path: Option<PathBuf>,
}

/// Sync batching and caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Records per relational transaction.
    pub batch_size: usize,
    /// Maximum records per event-sync request.
    pub event_sync_max_records: usize,
    /// Compare-and-swap attempts for object-storage document merges.
    pub mirror_cas_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            event_sync_max_records: DEFAULT_EVENT_SYNC_MAX_RECORDS,
            mirror_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

impl SyncConfig {
    /// Returns the limits handed to the sync engine.
    #[must_use]
    pub const fn limits(&self) -> SyncLimits {
        SyncLimits {
            batch_size: self.batch_size,
            event_sync_max_records: self.event_sync_max_records,
        }
    }
}

/// JWT configuration for production authentication.
#[derive(Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default)]
    pub hs256_secret: Option<String>,

    /// RS256 public key in PEM format for verifying bearer tokens.
    ///
    /// Prefer `QUAY_JWT_PUBLIC_KEY_PATH` to avoid multiline env vars.
    #[serde(default)]
    pub rs256_public_key_pem: Option<String>,

    /// Optional issuer (`iss`) to enforce.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Optional audience (`aud`) to enforce.
    #[serde(default)]
    pub audience: Option<String>,

    /// Claim name that contains the caller identifier.
    #[serde(default = "default_subject_claim")]
    pub subject_claim: String,

    /// Claim name that contains the caller roles (array or comma string).
    #[serde(default = "default_roles_claim")]
    pub roles_claim: String,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("hs256_secret", &self.hs256_secret.as_ref().map(|_| "[REDACTED]"))
            .field("rs256_public_key_pem", &self.rs256_public_key_pem.is_some())
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("subject_claim", &self.subject_claim)
            .field("roles_claim", &self.roles_claim)
            .finish()
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            hs256_secret: None,
            rs256_public_key_pem: None,
            issuer: None,
            audience: None,
            subject_claim: default_subject_claim(),
            roles_claim: default_roles_claim(),
        }
    }
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

fn default_roles_claim() -> String {
    "roles".to_string()
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `QUAY_HTTP_PORT`
    /// - `QUAY_DEBUG`
    /// - `QUAY_CORS_ALLOWED_ORIGINS` (comma-separated, or `*`)
    /// - `QUAY_CORS_MAX_AGE_SECONDS`
    /// - `QUAY_JWT_SECRET`
    /// - `QUAY_JWT_PUBLIC_KEY_PEM`
    /// - `QUAY_JWT_PUBLIC_KEY_PATH`
    /// - `QUAY_JWT_ISSUER`
    /// - `QUAY_JWT_AUDIENCE`
    /// - `QUAY_JWT_SUBJECT_CLAIM`
    /// - `QUAY_JWT_ROLES_CLAIM`
    /// - `QUAY_DATABASE_PATH`
    /// - `QUAY_DOCUMENT_DB_PATH`
    /// - `QUAY_SYNC_BATCH_SIZE` (at least 1, default: 100)
    /// - `QUAY_EVENT_SYNC_MAX_RECORDS` (default: 100)
    /// - `QUAY_MIRROR_CAS_RETRIES` (default: 5)
    /// - `QUAY_RATE_LIMIT_ENABLED`
    /// - `QUAY_RATE_LIMIT_PER_MINUTE`
    /// - `QUAY_SYNC_RATE_LIMIT_PER_MINUTE`
    /// - `QUAY_REQUEST_TIMEOUT_SECS`
    /// - `QUAY_CONCURRENCY_LIMIT`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be parsed.
    #[allow(clippy::cognitive_complexity, clippy::too_many_lines)]
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("QUAY_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("QUAY_DEBUG")? {
            config.debug = debug;
        }

        if let Some(origins) = env_string("QUAY_CORS_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = parse_cors_allowed_origins(&origins);
        }
        if let Some(max_age) = env_u64("QUAY_CORS_MAX_AGE_SECONDS")? {
            config.cors.max_age_seconds = max_age;
        }

        if let Some(secret) = env_string("QUAY_JWT_SECRET") {
            config.jwt.hs256_secret = Some(secret);
        }
        if let Some(pem) = env_string("QUAY_JWT_PUBLIC_KEY_PEM") {
            config.jwt.rs256_public_key_pem = Some(normalize_pem(&pem));
        }
        if let Some(path) = env_string("QUAY_JWT_PUBLIC_KEY_PATH") {
            if config.jwt.rs256_public_key_pem.is_some() {
                return Err(Error::InvalidInput(
                    "QUAY_JWT_PUBLIC_KEY_PATH cannot be set with QUAY_JWT_PUBLIC_KEY_PEM"
                        .to_string(),
                ));
            }
            let pem = std::fs::read_to_string(&path).map_err(|e| {
                Error::InvalidInput(format!(
                    "QUAY_JWT_PUBLIC_KEY_PATH failed to read {path}: {e}"
                ))
            })?;
            config.jwt.rs256_public_key_pem = Some(normalize_pem(&pem));
        }
        if let Some(issuer) = env_string("QUAY_JWT_ISSUER") {
            config.jwt.issuer = Some(issuer);
        }
        if let Some(audience) = env_string("QUAY_JWT_AUDIENCE") {
            config.jwt.audience = Some(audience);
        }
        if let Some(claim) = env_string("QUAY_JWT_SUBJECT_CLAIM") {
            config.jwt.subject_claim = claim;
        }
        if let Some(claim) = env_string("QUAY_JWT_ROLES_CLAIM") {
            config.jwt.roles_claim = claim;
        }

        config.storage.database_path = env_string("QUAY_DATABASE_PATH").map(PathBuf::from);
        config.storage.document_db_path = env_string("QUAY_DOCUMENT_DB_PATH").map(PathBuf::from);

        if let Some(size) = env_usize("QUAY_SYNC_BATCH_SIZE")? {
            if size == 0 {
                return Err(Error::InvalidInput(
                    "QUAY_SYNC_BATCH_SIZE must be at least 1".to_string(),
                ));
            }
            config.sync.batch_size = size;
        }
        if let Some(max) = env_usize("QUAY_EVENT_SYNC_MAX_RECORDS")? {
            config.sync.event_sync_max_records = max;
        }
        if let Some(retries) = env_u32("QUAY_MIRROR_CAS_RETRIES")? {
            config.sync.mirror_cas_retries = retries;
        }

        if let Some(enabled) = env_bool("QUAY_RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = enabled;
        }
        if let Some(limit) = env_u32("QUAY_RATE_LIMIT_PER_MINUTE")? {
            config.rate_limit.default_requests_per_minute = limit;
        }
        if let Some(limit) = env_u32("QUAY_SYNC_RATE_LIMIT_PER_MINUTE")? {
            config.rate_limit.sync_requests_per_minute = limit;
        }

        config.request_timeout_secs = env_u64("QUAY_REQUEST_TIMEOUT_SECS")?.filter(|s| *s > 0);
        config.concurrency_limit = env_usize("QUAY_CONCURRENCY_LIMIT")?.filter(|n| *n > 0);

        Ok(config)
    }

    /// Returns true when either store runs in memory.
    #[must_use]
    pub const fn uses_memory_stores(&self) -> bool {
        self.storage.database_path.is_none() || self.storage.document_db_path.is_none()
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

pub(crate) fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_cors_allowed_origins(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed == "*" {
        return vec!["*".to_string()];
    }

    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_pem(pem: &str) -> String {
    let trimmed = pem.trim();
    if trimmed.contains("\\n") && !trimmed.contains('\n') {
        trimmed.replace("\\n", "\n")
    } else {
        trimmed.to_string()
    }
}
