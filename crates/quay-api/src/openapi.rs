//! `OpenAPI` (3.1) specification generation for `quay-api`.
//!
//! The generated document is served at `/openapi.json` and can be written to
//! disk with the `gen_openapi` binary for client generation.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// `OpenAPI` documentation for the Quay REST API (`/api/v1/*`).
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Quay API",
        description = "Vessel and port access-control backend"
    ),
    paths(
        crate::routes::entities::create_record,
        crate::routes::entities::list_records,
        crate::routes::entities::get_record,
        crate::routes::entities::update_record,
        crate::routes::entities::delete_record,
        crate::routes::sync::sync_records,
        crate::routes::sync::sync_events,
        crate::routes::lookups::area_portals,
        crate::routes::lookups::area_beacons,
        crate::routes::lookups::access_check,
        crate::routes::lookups::dashboard,
        crate::routes::reconcile::reconcile,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::routes::entities::RecordResponse,
            crate::routes::entities::ListRecordsResponse,
            crate::routes::sync::SyncRequest,
            crate::routes::sync::EventSyncRequest,
            crate::routes::sync::BatchResponse,
            crate::routes::sync::SyncResponse,
            crate::routes::lookups::AccessCheckRequest,
            crate::routes::lookups::AccessCheckResponse,
            crate::routes::lookups::OccupancyResponse,
            crate::routes::lookups::ExpiringResponse,
            crate::routes::lookups::DashboardResponse,
            crate::routes::reconcile::ReconcileResponse,
        )
    ),
    tags(
        (name = "entities", description = "Entity CRUD"),
        (name = "sync", description = "Batched sync from edge devices"),
        (name = "lookups", description = "Area, access and dashboard lookups"),
        (name = "reconcile", description = "Store drift detection and repair"),
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearerAuth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Returns the generated `OpenAPI` spec.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Returns the generated `OpenAPI` spec serialized as pretty JSON.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn openapi_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&openapi())
}
