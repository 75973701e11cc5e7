//! Per-caller rate limiting.
//!
//! Every authenticated subject gets its own token bucket. Sync endpoints
//! draw from a separate, smaller bucket since each call can touch hundreds
//! of rows in both stores.
//!
//! ## Rate Limit Categories
//!
//! - **Default**: 600 req/min per subject
//! - **Sync**: 120 req/min per subject
//!
//! ## Response Headers
//!
//! When rate limited, returns:
//! - `429 Too Many Requests` status
//! - `Retry-After` header with seconds to wait
//! - `X-RateLimit-Limit` with the configured limit

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::HeaderName;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use crate::context::RequestContext;
use crate::error::ApiError;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Default requests per minute per subject.
    #[serde(default = "default_requests_per_minute")]
    pub default_requests_per_minute: u32,

    /// Sync requests per minute per subject.
    #[serde(default = "default_sync_per_minute")]
    pub sync_requests_per_minute: u32,

    /// Maximum burst size (requests allowed above steady rate).
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_enabled() -> bool {
    true
}

const fn default_requests_per_minute() -> u32 {
    600
}

const fn default_sync_per_minute() -> u32 {
    120
}

const fn default_burst_size() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_requests_per_minute: default_requests_per_minute(),
            sync_requests_per_minute: default_sync_per_minute(),
            burst_size: default_burst_size(),
        }
    }
}

type SubjectLimiter = DefaultKeyedRateLimiter<String>;

/// How often idle subjects are dropped from the limiters.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Which token bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Everything outside `/sync`.
    Default,
    /// `/sync` and `/sync/events`.
    Sync,
}

impl Bucket {
    /// Picks the bucket for a matched route template.
    #[must_use]
    pub fn for_endpoint(endpoint: &str) -> Self {
        if endpoint.contains("/sync") {
            Self::Sync
        } else {
            Self::Default
        }
    }
}

/// Rate limiting state shared across all request handlers.
///
/// One keyed limiter per bucket, keyed by subject. Subjects whose bucket has
/// refilled are indistinguishable from new ones and are dropped by
/// [`RateLimitState::prune`].
pub struct RateLimitState {
    config: RateLimitConfig,
    default_limiter: SubjectLimiter,
    sync_limiter: SubjectLimiter,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("config", &self.config)
            .field("tracked_subjects", &self.tracked_subjects())
            .finish_non_exhaustive()
    }
}

fn keyed(per_minute: u32, burst: u32) -> SubjectLimiter {
    let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_minute(per_minute).allow_burst(burst))
}

impl RateLimitState {
    /// Creates new rate limit state with the given configuration.
    ///
    /// The sync burst is half the default burst, never more than one
    /// minute's allowance.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let default_limiter = keyed(config.default_requests_per_minute, config.burst_size);
        let sync_limiter = keyed(
            config.sync_requests_per_minute,
            (config.burst_size / 2).min(config.sync_requests_per_minute),
        );
        Self {
            config,
            default_limiter,
            sync_limiter,
        }
    }

    fn limiter(&self, bucket: Bucket) -> (&SubjectLimiter, u32) {
        match bucket {
            Bucket::Default => (&self.default_limiter, self.config.default_requests_per_minute),
            Bucket::Sync => (&self.sync_limiter, self.config.sync_requests_per_minute),
        }
    }

    /// Takes one token from `subject`'s bucket.
    pub async fn check(&self, bucket: Bucket, subject: &str) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed { limit: 0 };
        }
        let (limiter, limit) = self.limiter(bucket);
        match limiter.check_key(&subject.to_owned()) {
            Ok(()) => RateLimitResult::Allowed { limit },
            Err(not_until) => RateLimitResult::Limited {
                limit,
                retry_after_secs: not_until
                    .wait_time_from(DefaultClock::default().now())
                    .as_secs()
                    .max(1),
            },
        }
    }

    /// Checks the default limit for a subject.
    pub async fn check_default(&self, subject: &str) -> RateLimitResult {
        self.check(Bucket::Default, subject).await
    }

    /// Checks the sync limit for a subject.
    pub async fn check_sync(&self, subject: &str) -> RateLimitResult {
        self.check(Bucket::Sync, subject).await
    }

    /// Number of subjects currently held across both buckets.
    #[must_use]
    pub fn tracked_subjects(&self) -> usize {
        self.default_limiter.len() + self.sync_limiter.len()
    }

    /// Drops subjects whose buckets have fully refilled. Returns how many
    /// entries were removed.
    pub fn prune(&self) -> usize {
        let before = self.tracked_subjects();
        for limiter in [&self.default_limiter, &self.sync_limiter] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
        before.saturating_sub(self.tracked_subjects())
    }

    /// Prunes idle subjects every `every` until the state is dropped.
    pub fn spawn_pruner(state: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let state = Arc::downgrade(state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else { break };
                let removed = state.prune();
                if removed > 0 {
                    tracing::debug!(removed, remaining = state.tracked_subjects(), "pruned idle rate limiters");
                }
            }
        })
    }
}

/// Result of a rate limit check.
#[derive(Debug)]
pub enum RateLimitResult {
    /// Request is allowed.
    Allowed {
        /// Configured limit (0 when disabled).
        limit: u32,
    },
    /// Request is rate limited.
    Limited {
        /// Configured limit.
        limit: u32,
        /// Seconds until the client can retry.
        retry_after_secs: u64,
    },
}

/// Rate limiting middleware for Axum.
///
/// Runs after authentication, so the verified subject is the bucket key.
pub async fn rate_limit_middleware(
    State(rate_limit): State<Arc<RateLimitState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (subject, request_id) = req.extensions().get::<RequestContext>().map_or_else(
        || ("anonymous".to_string(), None),
        |ctx| (ctx.subject.clone(), Some(ctx.request_id.clone())),
    );

    let endpoint = crate::metrics::endpoint_label(&req);
    let bucket = Bucket::for_endpoint(&endpoint);

    let (limit, mut response) = match rate_limit.check(bucket, &subject).await {
        RateLimitResult::Allowed { limit } => (limit, next.run(req).await),
        RateLimitResult::Limited {
            limit,
            retry_after_secs,
        } => {
            tracing::warn!(
                subject = %subject,
                endpoint = %endpoint,
                bucket = ?bucket,
                limit,
                retry_after_secs,
                "rate limit exceeded"
            );
            crate::metrics::record_rate_limit_hit(&endpoint);

            let mut error = ApiError::too_many_requests(format!(
                "rate limit of {limit} requests per minute exceeded"
            ))
            .with_retry_after(retry_after_secs);
            if let Some(request_id) = request_id {
                error = error.with_request_id(request_id);
            }
            (limit, error.into_response())
        }
    };

    if limit > 0 {
        response
            .headers_mut()
            .insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    }
    response
}
