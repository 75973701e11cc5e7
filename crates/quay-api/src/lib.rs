//! # quay-api
//!
//! HTTP layer for the Quay vessel and port access-control backend.
//!
//! This crate provides the API surface, handling:
//!
//! - **Authentication**: JWT bearer tokens, or identity headers in debug mode
//! - **Routing**: entity CRUD, batched sync, lookups and reconciliation
//! - **Protection**: per-subject rate limits, timeouts and concurrency caps
//! - **Observability**: request ids, Prometheus metrics and tracing
//!
//! All persistence and sync semantics live in `quay-store`.
//!
//! ## Endpoints
//!
//! ```text
//!   GET  /health                         - Liveness
//!   GET  /ready                          - Both stores reachable
//!   GET  /metrics                        - Prometheus exposition
//!   GET  /openapi.json                   - OpenAPI document
//!   /api/v1/entities/{collection}[/{id}] - Entity CRUD
//!   POST /api/v1/sync                    - Batched upsert of one entity
//!   POST /api/v1/sync/events             - Batched upsert of events (capped)
//!   GET  /api/v1/areas/{id}/portals      - Portals in an area
//!   GET  /api/v1/areas/{id}/beacons      - Beacons in an area
//!   POST /api/v1/access/check            - Boarding decision
//!   GET  /api/v1/dashboard               - Operational aggregates
//!   POST /api/v1/reconcile/{collection}  - Drift check and repair (admin)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use quay_api::server::Server;
//!
//! let server = Server::builder().http_port(8080).debug(true).build()?;
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod openapi;
pub mod rate_limit;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::{Server, Stores};
}
