//! Poller (C5): periodically asks the Record Store which keys, among the
//! partitions this instance currently owns, have due work, and hands each
//! one to the Key-Sequencer.

use std::sync::Arc;
use std::time::Duration;

use obx_coordinator::OwnedPartitions;
use sqlx::PgPool;

use crate::sequencer::Sequencer;

pub struct PollerConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig { interval: Duration::from_millis(500), batch_size: 256 }
    }
}

pub fn spawn(
    pool: PgPool,
    owned_partitions: OwnedPartitions,
    sequencer: Arc<Sequencer>,
    config: PollerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;

            let owned: Vec<i16> = owned_partitions.snapshot().await.iter().map(|p| *p as i16).collect();
            if owned.is_empty() {
                // No partitions owned yet (cluster still rebalancing, or this
                // instance has none this round) — nothing to poll for.
                continue;
            }

            match obx_db::keys_with_due_records(&pool, &owned, config.batch_size).await {
                Ok(keys) => {
                    for key in keys {
                        sequencer.dispatch_key(key);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "keys_with_due_records failed, will retry next tick");
                }
            }
        }
    })
}
