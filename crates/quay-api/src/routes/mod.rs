//! HTTP route handlers.

pub mod entities;
pub mod lookups;
pub mod reconcile;
pub mod sync;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// `/api/v1` routes (authenticated).
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(entities::routes())
        .merge(sync::routes())
        .merge(lookups::routes())
        .merge(reconcile::routes())
}
