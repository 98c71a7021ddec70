//! Cluster Coordinator (C4): keeps this instance's heartbeat alive, reaps
//! crashed peers, and republishes the set of partitions this instance
//! currently owns.
//!
//! Three independent periodic tasks run on the Tokio runtime, each its
//! own `tokio::time::interval` loop spawned separately so one running
//! long never starves the others — the same shape the daemon uses for its
//! own heartbeat broadcast.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use obx_partition::{owner_of, PARTITION_COUNT};
use obx_schemas::Instance;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    pub rebalance_interval: Duration,
    pub reap_interval: Duration,
    /// An instance is considered dead once its heartbeat is older than
    /// this. Should comfortably exceed `heartbeat_interval`.
    pub stale_after: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            instance_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(5),
            rebalance_interval: Duration::from_secs(5),
            reap_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Pure function: given the live-instance snapshot, which partitions does
/// `instance_id` own? Split out from the coordinator's I/O loop so it can
/// be unit tested without a database.
pub fn compute_owned_partitions(instance_id: &str, instances: &[Instance]) -> HashSet<u16> {
    let mut owned = HashSet::new();
    if instances.is_empty() {
        return owned;
    }
    for partition in 0..PARTITION_COUNT {
        if let Some(owner) = owner_of(partition, instances) {
            if owner.instance_id == instance_id {
                owned.insert(partition);
            }
        }
    }
    owned
}

/// Shared, read-mostly view of the partitions this instance currently
/// owns. The rebalance task is the sole writer; the poller and
/// key-sequencer are readers, each taking a cheap `Arc` clone of the
/// current snapshot rather than holding the lock across their own work.
#[derive(Clone)]
pub struct OwnedPartitions {
    inner: Arc<RwLock<Arc<HashSet<u16>>>>,
}

impl OwnedPartitions {
    pub fn new() -> Self {
        OwnedPartitions { inner: Arc::new(RwLock::new(Arc::new(HashSet::new()))) }
    }

    pub async fn snapshot(&self) -> Arc<HashSet<u16>> {
        self.inner.read().await.clone()
    }

    /// Is `instance` still the owner of `partition` as of the last published
    /// snapshot? Consulted mid-sequence by the key-sequencer: an instance
    /// that has lost ownership must abort dispatch for that key after its
    /// current record rather than start a new one.
    pub async fn owns(&self, partition: u16) -> bool {
        self.inner.read().await.contains(&partition)
    }

    pub async fn publish(&self, partitions: HashSet<u16>) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(partitions);
    }
}

impl Default for OwnedPartitions {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the three spawned background tasks. Dropping it does not
/// stop the tasks; call `shutdown` to abort them during graceful
/// shutdown, after the instance has been marked DRAINING and drained.
pub struct CoordinatorHandle {
    heartbeat: JoinHandle<()>,
    reap: JoinHandle<()>,
    rebalance: JoinHandle<()>,
    pub owned_partitions: OwnedPartitions,
}

impl CoordinatorHandle {
    pub fn shutdown(self) {
        self.heartbeat.abort();
        self.reap.abort();
        self.rebalance.abort();
    }
}

/// Starts the coordinator's background tasks against `pool`, registering
/// `config.instance_id` as LIVE first so the very first rebalance tick
/// sees this instance in the live set.
pub async fn spawn(pool: PgPool, config: CoordinatorConfig) -> anyhow::Result<CoordinatorHandle> {
    obx_db::register_instance(&pool, &config.instance_id).await?;

    let owned_partitions = OwnedPartitions::new();

    let heartbeat = {
        let pool = pool.clone();
        let instance_id = config.instance_id.clone();
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = obx_db::update_heartbeat(&pool, &instance_id).await {
                    tracing::warn!(error = %err, "heartbeat update failed, will retry next tick");
                }
            }
        })
    };

    let reap = {
        let pool = pool.clone();
        let interval = config.reap_interval;
        let stale_after = config.stale_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(30));
                match obx_db::reap_stale(&pool, cutoff).await {
                    Ok(n) if n > 0 => tracing::info!(reaped = n, "reaped stale instances"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "reap_stale failed, will retry next tick"),
                }
            }
        })
    };

    let rebalance = {
        let pool = pool.clone();
        let instance_id = config.instance_id.clone();
        let interval = config.rebalance_interval;
        let stale_after = config.stale_after;
        let owned_partitions = owned_partitions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(30));
                match obx_db::list_live(&pool, cutoff).await {
                    Ok(instances) => {
                        let owned = compute_owned_partitions(&instance_id, &instances);
                        tracing::debug!(owned = owned.len(), live = instances.len(), "rebalanced");
                        owned_partitions.publish(owned).await;
                    }
                    Err(err) => tracing::warn!(error = %err, "list_live failed, will retry next tick"),
                }
            }
        })
    };

    Ok(CoordinatorHandle { heartbeat, reap, rebalance, owned_partitions })
}

/// Graceful shutdown sequence: mark DRAINING so peers recompute
/// ownership away from this instance, wait for in-flight work to finish
/// (the caller drives that — the coordinator only owns the registry
/// transition), then delete the instance row.
pub async fn begin_drain(pool: &PgPool, instance_id: &str) -> anyhow::Result<()> {
    obx_db::mark_draining(pool, instance_id).await
}

pub async fn finish_drain(pool: &PgPool, instance_id: &str) -> anyhow::Result<()> {
    obx_db::delete_instance(pool, instance_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_schemas::InstanceStatus;

    fn inst(id: &str) -> Instance {
        Instance { instance_id: id.to_string(), status: InstanceStatus::Live, last_heartbeat: Utc::now(), registered_at: Utc::now() }
    }

    #[test]
    fn empty_cluster_owns_nothing() {
        assert!(compute_owned_partitions("a", &[]).is_empty());
    }

    #[test]
    fn single_instance_owns_every_partition() {
        let owned = compute_owned_partitions("a", &[inst("a")]);
        assert_eq!(owned.len(), PARTITION_COUNT as usize);
    }

    #[test]
    fn partitions_partition_the_full_range_across_instances() {
        let instances = vec![inst("a"), inst("b"), inst("c")];
        let mut union = HashSet::new();
        for instance in &instances {
            let owned = compute_owned_partitions(&instance.instance_id, &instances);
            for p in &owned {
                assert!(union.insert(*p), "partition {p} claimed by more than one instance");
            }
        }
        assert_eq!(union.len(), PARTITION_COUNT as usize);
    }

    #[tokio::test]
    async fn owned_partitions_snapshot_reflects_latest_publish() {
        let owned_partitions = OwnedPartitions::new();
        assert!(owned_partitions.snapshot().await.is_empty());

        let mut set = HashSet::new();
        set.insert(3u16);
        set.insert(7u16);
        owned_partitions.publish(set.clone()).await;

        assert_eq!(*owned_partitions.snapshot().await, set);
    }
}
