//! Shared runtime state for the daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself
//! beyond the periodic refresh task spawned by `spawn_status_refresh`.

use std::sync::Arc;
use std::time::Duration;

use obx_coordinator::OwnedPartitions;
use obx_db::{PendingRecordStats, RecordStatusCounts};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    LogLine { level: String, msg: String },
}

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Point-in-time snapshot of this instance's view of the cluster, returned
/// by GET /v1/status and carried inside SSE `status` events.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub instance_id: String,
    pub live_instance_count: usize,
    pub owned_partition_count: usize,
    pub records: RecordStatusCounts,
    pub pending: PendingRecordStats,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub instance_id: String,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    /// Snapshot refreshed periodically by `spawn_status_refresh`, never on
    /// the HTTP hot path — `/v1/status` only ever reads this cache.
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub owned_partitions: OwnedPartitions,
}

impl AppState {
    pub fn new(pool: PgPool, instance_id: String, owned_partitions: OwnedPartitions) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status =
            StatusSnapshot { daemon_uptime_secs: uptime_secs(), instance_id: instance_id.clone(), ..Default::default() };

        Self {
            pool,
            instance_id,
            bus,
            build: BuildInfo { service: "obx-daemon", version: env!("CARGO_PKG_VERSION") },
            status: Arc::new(RwLock::new(initial_status)),
            owned_partitions,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn a background task that refreshes the cached status snapshot from
/// the Record Store and Instance Registry, then publishes it to the SSE
/// bus. Keeps `record_status_counts`/`pending_record_stats` — each a
/// table-wide aggregate query — off the request path entirely.
pub fn spawn_status_refresh(
    pool: PgPool,
    instance_id: String,
    owned_partitions: OwnedPartitions,
    stale_after: Duration,
    status: Arc<RwLock<StatusSnapshot>>,
    bus: broadcast::Sender<BusMsg>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let owned: Vec<i16> = owned_partitions.snapshot().await.iter().map(|p| *p as i16).collect();
            let owned_partition_count = owned.len();

            let records = match obx_db::record_status_counts(&pool).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(error = %err, "record_status_counts failed, keeping previous snapshot");
                    continue;
                }
            };
            let pending = match obx_db::pending_record_stats(&pool, &owned).await {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(error = %err, "pending_record_stats failed, keeping previous snapshot");
                    continue;
                }
            };
            let cutoff = chrono::Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(30));
            let live_instance_count = match obx_db::list_live(&pool, cutoff).await {
                Ok(instances) => instances.len(),
                Err(err) => {
                    tracing::warn!(error = %err, "list_live failed, keeping previous live count");
                    status.read().await.live_instance_count
                }
            };

            let snap = StatusSnapshot {
                daemon_uptime_secs: uptime_secs(),
                instance_id: instance_id.clone(),
                live_instance_count,
                owned_partition_count,
                records,
                pending,
            };

            *status.write().await = snap.clone();
            let _ = bus.send(BusMsg::Status(snap));
        }
    });
}
