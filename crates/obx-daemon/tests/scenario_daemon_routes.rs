//! In-process scenario tests for the daemon's HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket,
//! driving it via `tower::ServiceExt::oneshot`. `AppState` wraps a real
//! pool, so every test here requires `OBX_DATABASE_URL` and is skipped
//! otherwise.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use obx_coordinator::OwnedPartitions;
use obx_daemon::{routes, state};
use tower::ServiceExt; // oneshot

fn make_state(pool: sqlx::PgPool, instance_id: &str) -> Arc<state::AppState> {
    Arc::new(state::AppState::new(pool, instance_id.to_string(), OwnedPartitions::new()))
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn health_reports_db_connectivity() {
    let Some(pool) = obx_testkit::try_db_pool().await else { return };
    let st = make_state(pool, "daemon-health-test");

    let req = Request::builder().method("GET").uri("/v1/health").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "obx-daemon");
    assert_eq!(json["db_ok"], true);
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn status_reports_this_instance_id_with_zeroed_counts_before_first_refresh() {
    let Some(pool) = obx_testkit::try_db_pool().await else { return };
    let st = make_state(pool, "daemon-status-test");

    let req = Request::builder().method("GET").uri("/v1/status").body(axum::body::Body::empty()).unwrap();
    let (status, body) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["instance_id"], "daemon-status-test");
    assert_eq!(json["records"]["pending"], 0);
    assert_eq!(json["owned_partition_count"], 0);
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn admin_schedule_enqueues_and_deduplicates_by_idempotency_key() {
    let Some(pool) = obx_testkit::try_db_pool().await else { return };
    let st = make_state(pool, "daemon-schedule-test");

    let body = serde_json::json!({
        "payload_type": "widget.created",
        "payload": {"id": 1},
        "key": "widget-1",
        "idempotency_key": "daemon-schedule-test-dedup",
    });

    let req1 = Request::builder()
        .method("POST")
        .uri("/v1/admin/schedule")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status1, body1) = call(routes::build_router(Arc::clone(&st)), req1).await;
    assert_eq!(status1, StatusCode::OK);
    let json1 = parse_json(body1);
    assert!(!json1["id"].is_null());
    assert_eq!(json1["deduplicated"], false);

    let req2 = Request::builder()
        .method("POST")
        .uri("/v1/admin/schedule")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status2, body2) = call(routes::build_router(Arc::clone(&st)), req2).await;
    assert_eq!(status2, StatusCode::OK);
    let json2 = parse_json(body2);
    assert!(json2["id"].is_null());
    assert_eq!(json2["deduplicated"], true);
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn stream_returns_event_stream_content_type() {
    let Some(pool) = obx_testkit::try_db_pool().await else { return };
    let st = make_state(pool, "daemon-stream-test");

    let req = Request::builder().method("GET").uri("/v1/stream").body(axum::body::Body::empty()).unwrap();
    let resp = routes::build_router(st).oneshot(req).await.expect("oneshot failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers().get("content-type").and_then(|v| v.to_str().ok()).unwrap_or_default();
    assert!(content_type.contains("text/event-stream"));
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn unknown_route_returns_404() {
    let Some(pool) = obx_testkit::try_db_pool().await else { return };
    let st = make_state(pool, "daemon-404-test");

    let req = Request::builder().method("GET").uri("/v1/does_not_exist").body(axum::body::Body::empty()).unwrap();
    let (status, _) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
