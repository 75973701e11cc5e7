//! End-to-end tests for the HTTP surface.
//!
//! Each test builds a debug-mode router over recording in-memory stores and
//! drives it with `tower::ServiceExt::oneshot`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use quay_api::config::{StorageConfig, SyncConfig};
use quay_api::rate_limit::RateLimitConfig;
use quay_api::server::{Server, Stores};
use quay_test_utils::{authorization, event_records, user, vessel, TestStores};

fn stores_of(test: &TestStores) -> Stores {
    Stores {
        relational: test.relational.clone(),
        documents: test.documents.clone(),
    }
}

fn debug_router(test: &TestStores) -> Result<Router> {
    let server = Server::builder()
        .debug(true)
        .stores(stores_of(test))
        .build()?;
    Ok(server.test_router())
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    roles: Option<&str>,
    body: Option<Value>,
) -> Result<Reply> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-User-Id", "gate-3");
    if let Some(roles) = roles {
        builder = builder.header("X-Roles", roles);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?)),
        None => builder.body(Body::empty()),
    }
    .context("build request")?;

    let response = router
        .clone()
        .oneshot(request)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .context("read response body")?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).context("parse JSON body")?
    };
    Ok(Reply {
        status,
        headers,
        body,
    })
}

#[tokio::test]
async fn health_echoes_request_id() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-from-portal")
        .body(Body::empty())?;
    let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-from-portal")
    );
    Ok(())
}

#[tokio::test]
async fn ready_reports_document_outage() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let ok = send(&router, Method::GET, "/ready", None, None).await?;
    assert_eq!(ok.status, StatusCode::OK);

    test.documents.set_unavailable(true);
    let down = send(&router, Method::GET, "/ready", None, None).await?;
    assert_eq!(down.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(down.body["ready"], false);
    Ok(())
}

#[tokio::test]
async fn sync_of_250_events_commits_three_batches() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let reply = send(
        &router,
        Method::POST,
        "/api/v1/sync",
        None,
        Some(json!({"entity": "Event", "records": event_records(250)})),
    )
    .await?;

    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert_eq!(reply.body["entity"], "Event");
    assert_eq!(reply.body["received"], 250);
    assert_eq!(reply.body["mirrored"], 250);
    let sizes: Vec<u64> = reply.body["batches"]
        .as_array()
        .context("batches")?
        .iter()
        .filter_map(|b| b["records"].as_u64())
        .collect();
    assert_eq!(sizes, [100, 100, 50]);

    assert_eq!(test.relational.committed_batches(), [100, 100, 50]);
    assert_eq!(test.documents.merge_upserts(), 250);
    Ok(())
}

#[tokio::test]
async fn resync_is_idempotent_over_http() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;
    let body = json!({"entity": "event", "records": event_records(20)});

    let first = send(&router, Method::POST, "/api/v1/sync", None, Some(body.clone())).await?;
    assert_eq!(first.body["batches"][0]["inserted"], 20);

    let second = send(&router, Method::POST, "/api/v1/sync", None, Some(body)).await?;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["batches"][0]["inserted"], 0);
    assert_eq!(second.body["batches"][0]["unchanged"], 20);

    let page = send(&router, Method::GET, "/api/v1/entities/events?limit=100", None, None).await?;
    assert_eq!(page.body["records"].as_array().map(Vec::len), Some(20));
    Ok(())
}

#[tokio::test]
async fn event_sync_over_cap_is_rejected_without_writes() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let reply = send(
        &router,
        Method::POST,
        "/api/v1/sync/events",
        None,
        Some(json!({"records": event_records(150)})),
    )
    .await?;

    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(reply.body["code"], "PAYLOAD_TOO_LARGE");
    assert!(reply.body["requestId"].is_string());
    assert_eq!(test.relational.write_count(), 0);
    assert_eq!(test.documents.merge_upserts(), 0);

    let accepted = send(
        &router,
        Method::POST,
        "/api/v1/sync/events",
        None,
        Some(json!({"records": event_records(100)})),
    )
    .await?;
    assert_eq!(accepted.status, StatusCode::OK);
    assert_eq!(test.relational.committed_batches(), [100]);
    Ok(())
}

#[tokio::test]
async fn unknown_entity_is_a_client_error_without_writes() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    for entity in ["Spaceship", "Authorization"] {
        let reply = send(
            &router,
            Method::POST,
            "/api/v1/sync",
            None,
            Some(json!({"entity": entity, "records": [{"id": "x-1"}]})),
        )
        .await?;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST, "{entity}");
    }
    assert_eq!(test.relational.write_count(), 0);
    assert_eq!(test.documents.merge_upserts(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_batch_reports_progress() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;
    test.relational.fail_batch(1);

    let reply = send(
        &router,
        Method::POST,
        "/api/v1/sync",
        None,
        Some(json!({"entity": "Event", "records": event_records(250)})),
    )
    .await?;

    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.body["code"], "SYNC_BATCH_FAILED");
    assert_eq!(reply.body["details"]["batchIndex"], 1);
    assert_eq!(reply.body["details"]["committedRecords"], 100);
    assert_eq!(test.relational.committed_batches(), [100]);
    Ok(())
}

#[tokio::test]
async fn malformed_json_uses_error_body() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/sync")
        .header("X-User-Id", "gate-3")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"entity\": "))?;
    let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    assert_eq!(body["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn entity_crud_lifecycle() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let created = send(
        &router,
        Method::POST,
        "/api/v1/entities/vessels",
        None,
        Some(vessel("v-1", "Northern Star", "c-1")),
    )
    .await?;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["id"], "v-1");
    assert_eq!(created.body["collection"], "vessels");

    let duplicate = send(
        &router,
        Method::POST,
        "/api/v1/entities/vessels",
        None,
        Some(vessel("v-1", "Northern Star", "c-1")),
    )
    .await?;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let invalid = send(
        &router,
        Method::POST,
        "/api/v1/entities/vessels",
        None,
        Some(json!({"id": "v-2", "name": "No company"})),
    )
    .await?;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    let patched = send(
        &router,
        Method::PATCH,
        "/api/v1/entities/vessels/v-1",
        None,
        Some(json!({"name": "Southern Star", "flag": "NO"})),
    )
    .await?;
    assert_eq!(patched.status, StatusCode::OK);
    assert_eq!(patched.body["body"]["name"], "Southern Star");
    assert_eq!(patched.body["body"]["companyId"], "c-1");

    let fetched = send(&router, Method::GET, "/api/v1/entities/vessels/v-1", None, None).await?;
    assert_eq!(fetched.body["body"]["flag"], "NO");

    let deleted = send(&router, Method::DELETE, "/api/v1/entities/vessels/v-1", None, None).await?;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    let missing = send(&router, Method::GET, "/api/v1/entities/vessels/v-1", None, None).await?;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body["code"], "NOT_FOUND");

    let unknown = send(&router, Method::GET, "/api/v1/entities/spaceships", None, None).await?;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn list_filters_and_paginates() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    for (id, company) in [("v-1", "c-1"), ("v-2", "c-2"), ("v-3", "c-1"), ("v-4", "c-1")] {
        let reply = send(
            &router,
            Method::POST,
            "/api/v1/entities/vessels",
            None,
            Some(vessel(id, id, company)),
        )
        .await?;
        assert_eq!(reply.status, StatusCode::CREATED);
    }

    let first = send(
        &router,
        Method::GET,
        "/api/v1/entities/vessels?companyId=c-1&limit=2",
        None,
        None,
    )
    .await?;
    assert_eq!(first.status, StatusCode::OK);
    let ids: Vec<&str> = first.body["records"]
        .as_array()
        .context("records")?
        .iter()
        .filter_map(|r| r["id"].as_str())
        .collect();
    assert_eq!(ids, ["v-1", "v-3"]);
    let token = first.body["nextPageToken"].as_str().context("token")?;

    let second = send(
        &router,
        Method::GET,
        &format!("/api/v1/entities/vessels?companyId=c-1&limit=2&page_token={token}"),
        None,
        None,
    )
    .await?;
    assert_eq!(second.body["records"][0]["id"], "v-4");
    assert!(second.body.get("nextPageToken").is_none());

    let bad = send(&router, Method::GET, "/api/v1/entities/vessels?limit=0", None, None).await?;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn area_lookups() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let writes = [
        ("areas", json!({"id": "a-1", "name": "North quay"})),
        ("portals", json!({"id": "p-1", "name": "Gate 3", "areaId": "a-1"})),
        ("portals", json!({"id": "p-2", "name": "Gate 9", "areaId": "a-2"})),
        ("beacons", json!({"id": "b-1", "label": "Bollard 12", "areaId": "a-1"})),
    ];
    for (collection, body) in writes {
        let reply = send(
            &router,
            Method::POST,
            &format!("/api/v1/entities/{collection}"),
            None,
            Some(body),
        )
        .await?;
        assert_eq!(reply.status, StatusCode::CREATED);
    }

    let portals = send(&router, Method::GET, "/api/v1/areas/a-1/portals", None, None).await?;
    assert_eq!(portals.status, StatusCode::OK);
    assert_eq!(portals.body["records"].as_array().map(Vec::len), Some(1));
    assert_eq!(portals.body["records"][0]["id"], "p-1");

    let beacons = send(&router, Method::GET, "/api/v1/areas/a-1/beacons", None, None).await?;
    assert_eq!(beacons.body["records"][0]["id"], "b-1");

    let missing = send(&router, Method::GET, "/api/v1/areas/a-9/portals", None, None).await?;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn access_check_follows_authorizations() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let writes = [
        ("users", user("u-1", "Ada", "c-1")),
        ("vessels", vessel("v-1", "Northern Star", "c-1")),
        (
            "authorizations",
            authorization(
                "auth-1",
                "u-1",
                "v-1",
                "2024-05-01T00:00:00Z",
                "2024-05-02T00:00:00Z",
            ),
        ),
    ];
    for (collection, body) in writes {
        let reply = send(
            &router,
            Method::POST,
            &format!("/api/v1/entities/{collection}"),
            None,
            Some(body),
        )
        .await?;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
    }

    let inside = send(
        &router,
        Method::POST,
        "/api/v1/access/check",
        None,
        Some(json!({"userId": "u-1", "vesselId": "v-1", "at": "2024-05-01T12:00:00Z"})),
    )
    .await?;
    assert_eq!(inside.status, StatusCode::OK);
    assert_eq!(inside.body["allowed"], true);
    assert_eq!(inside.body["authorizationId"], "auth-1");

    let after = send(
        &router,
        Method::POST,
        "/api/v1/access/check",
        None,
        Some(json!({"userId": "u-1", "vesselId": "v-1", "at": "2024-05-02T00:00:00Z"})),
    )
    .await?;
    assert_eq!(after.body["allowed"], false);
    assert_eq!(after.body["reason"], "no_valid_authorization");

    let stranger = send(
        &router,
        Method::POST,
        "/api/v1/access/check",
        None,
        Some(json!({"userId": "u-9", "vesselId": "v-1"})),
    )
    .await?;
    assert_eq!(stranger.body["reason"], "unknown_user");

    let bad_time = send(
        &router,
        Method::POST,
        "/api/v1/access/check",
        None,
        Some(json!({"userId": "u-1", "vesselId": "v-1", "at": "yesterday"})),
    )
    .await?;
    assert_eq!(bad_time.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn dashboard_counts_collections() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    send(
        &router,
        Method::POST,
        "/api/v1/sync",
        None,
        Some(json!({"entity": "Vessel", "records": [vessel("v-1", "Northern Star", "c-1")]})),
    )
    .await?;

    let reply = send(&router, Method::GET, "/api/v1/dashboard?horizon_days=7", None, None).await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["totals"]["vessels"], 1);
    assert!(reply.body["generatedAt"].is_string());

    let bad = send(&router, Method::GET, "/api/v1/dashboard?window_hours=0", None, None).await?;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn reconcile_requires_admin_and_repairs() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    test.documents.fail_id("v-2");
    send(
        &router,
        Method::POST,
        "/api/v1/sync",
        None,
        Some(json!({"entity": "Vessel", "records": [
            vessel("v-1", "Northern Star", "c-1"),
            vessel("v-2", "Southern Star", "c-1"),
        ]})),
    )
    .await?;

    let denied = send(&router, Method::POST, "/api/v1/reconcile/vessels", None, None).await?;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let report = send(
        &router,
        Method::POST,
        "/api/v1/reconcile/vessels?repair=true",
        Some("admin"),
        None,
    )
    .await?;
    assert_eq!(report.status, StatusCode::OK, "{}", report.body);
    assert_eq!(report.body["report"]["collection"], "vessels");
    assert_eq!(report.body["report"]["issues"][0]["id"], "v-2");
    assert!(report.body["repair"].is_object());
    Ok(())
}

#[tokio::test]
async fn sync_rate_limit_returns_retry_after() -> Result<()> {
    let test = TestStores::new();
    let server = Server::builder()
        .debug(true)
        .stores(stores_of(&test))
        .rate_limit(RateLimitConfig {
            enabled: true,
            default_requests_per_minute: 600,
            sync_requests_per_minute: 1,
            burst_size: 2,
        })
        .build()?;
    let router = server.test_router();
    let body = json!({"records": event_records(1)});

    let first = send(&router, Method::POST, "/api/v1/sync/events", None, Some(body.clone())).await?;
    assert_eq!(first.status, StatusCode::OK);

    let second = send(&router, Method::POST, "/api/v1/sync/events", None, Some(body)).await?;
    assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers.contains_key("retry-after"));
    Ok(())
}

#[tokio::test]
async fn configured_batch_size_is_honoured() -> Result<()> {
    let test = TestStores::new();
    let server = Server::builder()
        .debug(true)
        .stores(stores_of(&test))
        .sync(SyncConfig {
            batch_size: 40,
            ..SyncConfig::default()
        })
        .build()?;
    let router = server.test_router();

    let reply = send(
        &router,
        Method::POST,
        "/api/v1/sync",
        None,
        Some(json!({"entity": "Event", "records": event_records(100)})),
    )
    .await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(test.relational.committed_batches(), [40, 40, 20]);
    Ok(())
}

#[tokio::test]
async fn debug_mode_requires_user_header() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let request = Request::builder()
        .uri("/api/v1/dashboard")
        .body(Body::empty())?;
    let response = router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));
    Ok(())
}

#[tokio::test]
async fn production_mode_verifies_bearer_tokens() -> Result<()> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let test = TestStores::new();
    let router = Server::builder()
        .jwt_hs256_secret("test-secret")
        .stores(stores_of(&test))
        .build()?
        .test_router();

    let anonymous = Request::builder()
        .uri("/api/v1/dashboard")
        .body(Body::empty())?;
    let response = router
        .clone()
        .oneshot(anonymous)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = encode(
        &Header::default(),
        &json!({"sub": "gate-3", "roles": ["portal"], "exp": chrono::Utc::now().timestamp() + 600}),
        &EncodingKey::from_secret(b"test-secret"),
    )?;
    let authorized = Request::builder()
        .uri("/api/v1/dashboard")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())?;
    let response = router
        .oneshot(authorized)
        .await
        .map_err(|err| -> anyhow::Error { match err {} })?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn openapi_document_is_served() -> Result<()> {
    let test = TestStores::new();
    let router = debug_router(&test)?;

    let reply = send(&router, Method::GET, "/openapi.json", None, None).await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body["paths"]["/api/v1/sync/events"].is_object());
    Ok(())
}

#[tokio::test]
async fn file_backed_stores_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let storage = StorageConfig {
        database_path: Some(dir.path().join("quay.db")),
        document_db_path: Some(dir.path().join("documents.db")),
    };

    let open_router = || -> Result<Router> {
        let stores = Stores::open(&storage, &SyncConfig::default())?;
        Ok(Server::builder().debug(true).stores(stores).build()?.test_router())
    };

    let router = open_router()?;
    let reply = send(
        &router,
        Method::POST,
        "/api/v1/sync/events",
        None,
        Some(json!({"records": event_records(30)})),
    )
    .await?;
    assert_eq!(reply.status, StatusCode::OK);
    drop(router);

    let router = open_router()?;
    let fetched = send(&router, Method::GET, "/api/v1/entities/events/evt-00029", None, None).await?;
    assert_eq!(fetched.status, StatusCode::OK);
    assert_eq!(fetched.body["body"]["portalId"], "gate-3");

    let report = send(
        &router,
        Method::POST,
        "/api/v1/reconcile/events",
        Some("admin"),
        None,
    )
    .await?;
    assert_eq!(report.body["report"]["relationalCount"], 30);
    assert_eq!(report.body["report"]["documentCount"], 30);
    assert!(report.body["report"]["issues"].as_array().is_some_and(Vec::is_empty));
    Ok(())
}
