//! obx-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! wires the coordinator and dispatcher, builds the shared HTTP state, and
//! starts the server. All route handlers live in `routes.rs`; all shared
//! state types live in `state.rs`.
//!
//! Handler registration is this binary's integration point: it boots with
//! an empty `HandlerRegistry` and identity routing, since which handlers
//! run for which payload types is an application concern. An embedding
//! application links against the `obx_daemon` library and builds its own
//! `main` around `routes::build_router`/`state::AppState`, registering
//! handlers before calling `obx_dispatch::DispatcherBuilder::with_handlers`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use obx_daemon::{routes, state};
use obx_dispatch::{poller::PollerConfig, DispatcherBuilder, DispatcherConfig};
use obx_handlers::HandlerRegistry;
use obx_retry::DefaultErrorClassifier;
use obx_routing::RoutingTable;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let pool = obx_db::connect_from_env().await.context("connect to Postgres")?;
    obx_db::migrate(&pool).await.context("run migrations")?;

    let config = load_config()?;
    let instance_id =
        std::env::var("OBX_INSTANCE_ID").unwrap_or_else(|_| format!("obx-daemon-{}", uuid::Uuid::new_v4()));

    let coordinator = obx_coordinator::spawn(
        pool.clone(),
        obx_coordinator::CoordinatorConfig {
            instance_id: instance_id.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            rebalance_interval: config.rebalance_interval(),
            reap_interval: config.stale_instance_timeout() / 2,
            stale_after: config.stale_instance_timeout(),
        },
    )
    .await
    .context("start coordinator")?;

    let dispatcher = DispatcherBuilder::new(
        pool.clone(),
        DispatcherConfig {
            instance_id: instance_id.clone(),
            worker_concurrency: config.worker_concurrency,
            poller: PollerConfig { interval: config.poll_interval(), batch_size: config.batch_size },
            delete_on_complete: config.delete_completed_records,
            stop_on_first_failure: config.stop_on_first_failure,
        },
        config.retry_policy(),
    )
    .with_handlers(HandlerRegistry::new())
    .with_routing(RoutingTable::new(Vec::new()))
    .with_classifier(Arc::new(DefaultErrorClassifier))
    .build();

    let dispatcher_handle = dispatcher.spawn(coordinator.owned_partitions.clone());

    let shared = Arc::new(state::AppState::new(pool.clone(), instance_id.clone(), coordinator.owned_partitions.clone()));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_status_refresh(
        pool.clone(),
        instance_id.clone(),
        coordinator.owned_partitions.clone(),
        config.stale_instance_timeout(),
        shared.status.clone(),
        shared.bus.clone(),
        Duration::from_secs(5),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)).on_response(DefaultOnResponse::new().level(Level::INFO)))
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!(%addr, instance_id = %shared.instance_id, "obx-daemon listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await.context("server crashed")?;

    info!("shutting down: draining");
    obx_coordinator::begin_drain(&pool, &shared.instance_id).await.context("begin_drain")?;
    dispatcher_handle.shutdown(config.graceful_shutdown_timeout()).await;
    obx_coordinator::finish_drain(&pool, &shared.instance_id).await.context("finish_drain")?;
    coordinator.shutdown();

    Ok(())
}

fn load_config() -> anyhow::Result<obx_config::DispatcherConfig> {
    let paths_env = std::env::var("OBX_CONFIG_PATHS").unwrap_or_default();
    let paths: Vec<&str> = paths_env.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    if paths.is_empty() {
        return Ok(obx_config::DispatcherConfig::default());
    }
    let loaded = obx_config::load_layered_yaml(&paths).context("load dispatcher config")?;
    obx_config::parse_and_validate(&loaded.config_json)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("OBX_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins =
        ["http://localhost", "http://127.0.0.1", "http://localhost:3000", "http://127.0.0.1:3000"];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new().allow_origin(origins).allow_methods([Method::GET, Method::POST]).allow_headers(tower_http::cors::Any)
}
