//! Axum router and all HTTP handlers for the daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    api_types::{HealthResponse, ScheduleRequest, ScheduleResponse},
    state::{uptime_secs, AppState, BusMsg},
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/admin/schedule", post(admin_schedule))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = obx_db::status(&st.pool).await.map(|s| s.ok).unwrap_or(false);
    (
        StatusCode::OK,
        Json(HealthResponse { ok: true, service: st.build.service, version: st.build.version, db_ok }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

/// Returns the cached snapshot refreshed periodically by
/// `state::spawn_status_refresh` — never runs the underlying aggregate
/// queries itself, so this endpoint stays cheap regardless of poll
/// frequency.
pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// POST /v1/admin/schedule
// ---------------------------------------------------------------------------

/// Manually enqueues a record. Intended for operator use and integration
/// test seeding — production producers call `obx_db::schedule` directly
/// inside their own transaction rather than going through HTTP.
pub(crate) async fn admin_schedule(State(st): State<Arc<AppState>>, Json(body): Json<ScheduleRequest>) -> Response {
    let result = obx_db::schedule(
        &st.pool,
        &body.payload_type,
        body.payload,
        Some(body.key.as_str()),
        body.context,
        body.idempotency_key.as_deref(),
    )
    .await;

    match result {
        Ok(id) => (StatusCode::OK, Json(ScheduleResponse { id, deduplicated: id.is_none() })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "admin_schedule failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ScheduleResponse { id: None, deduplicated: false }))
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(rx: broadcast::Receiver<BusMsg>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Status(_) => "status",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
