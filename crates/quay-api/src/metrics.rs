//! Metrics middleware and the Prometheus endpoint.
//!
//! Request latency, outcomes and concurrency per matched route, plus
//! rate limiter rejections. Store-level metrics (sync batches, mirror writes) are
//! described by `quay_store::metrics` and rendered by the same recorder.

use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Request latency histogram, labelled by route template.
pub const HTTP_REQUEST_SECONDS: &str = "quay_http_request_seconds";

/// Completed request counter.
pub const HTTP_REQUESTS: &str = "quay_http_requests_total";

/// Requests currently being handled.
pub const HTTP_IN_FLIGHT: &str = "quay_http_requests_in_flight";

/// Requests turned away by the rate limiter.
pub const RATE_LIMITED: &str = "quay_http_rate_limited_total";

const UNMATCHED_ENDPOINT: &str = "unmatched";
const SLOW_REQUEST_SECS: f64 = 1.0;
const TEXT_PLAIN: [(&str, &str); 1] = [("content-type", "text/plain; charset=utf-8")];

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder and describes every API and store metric.
///
/// Idempotent. Returns `None` when some other recorder won the race.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = RECORDER.get() {
        return Some(handle.clone());
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let handle = RECORDER.get_or_init(|| handle).clone();
            describe_histogram!(HTTP_REQUEST_SECONDS, "HTTP request latency in seconds");
            describe_counter!(HTTP_REQUESTS, "Completed HTTP requests");
            describe_gauge!(HTTP_IN_FLIGHT, "HTTP requests in progress");
            describe_counter!(RATE_LIMITED, "Requests rejected by the rate limiter");
            quay_store::metrics::register_metrics();
            tracing::info!("metrics recorder installed");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            RECORDER.get().cloned()
        }
    }
}

/// Returns the installed Prometheus handle.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    RECORDER.get().cloned()
}

/// Route template for labels, so `/entities/vessels/v-1` and
/// `/entities/vessels/v-2` share a series.
pub(crate) fn endpoint_label<B>(request: &Request<B>) -> String {
    match request.extensions().get::<MatchedPath>() {
        Some(path) => path.as_str().to_owned(),
        None => UNMATCHED_ENDPOINT.to_owned(),
    }
}

/// Records latency, outcome and in-flight count for every request.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let endpoint = endpoint_label(&request);
    let method = request.method().clone();
    let in_flight = gauge!(HTTP_IN_FLIGHT);
    in_flight.increment(1.0);
    let started = Instant::now();

    let response = next.run(request).await;

    in_flight.decrement(1.0);
    let elapsed = started.elapsed().as_secs_f64();
    let status = response.status();
    if elapsed > SLOW_REQUEST_SECS {
        tracing::warn!(
            endpoint = %endpoint,
            method = %method,
            status = status.as_u16(),
            elapsed_secs = elapsed,
            "slow request"
        );
    }
    let labels = [
        ("endpoint", endpoint),
        ("method", method.to_string()),
        ("status_class", status_class(status).to_owned()),
    ];
    histogram!(HTTP_REQUEST_SECONDS, &labels).record(elapsed);
    counter!(HTTP_REQUESTS, &labels).increment(1);

    response
}

fn status_class(status: StatusCode) -> &'static str {
    if status.is_informational() {
        "1xx"
    } else if status.is_success() {
        "2xx"
    } else if status.is_redirection() {
        "3xx"
    } else if status.is_client_error() {
        "4xx"
    } else if status.is_server_error() {
        "5xx"
    } else {
        "unknown"
    }
}

/// `GET /metrics` in the Prometheus text format.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (StatusCode::OK, TEXT_PLAIN, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            TEXT_PLAIN,
            "metrics recorder not installed".to_owned(),
        ),
    }
}

/// Counts one rate-limited request against `endpoint`.
pub fn record_rate_limit_hit(endpoint: &str) {
    counter!(RATE_LIMITED, "endpoint" => endpoint.to_owned()).increment(1);
}
