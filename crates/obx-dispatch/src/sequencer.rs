//! Key-Sequencer (C6): ensures at most one record per key is in flight at
//! a time, and that a key's records dispatch in creation order.
//!
//! Concurrency across *different* keys is bounded by a semaphore sized to
//! `worker_concurrency`, the same "bound expensive concurrent work" shape
//! a worker pool uses for its task slots.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use obx_coordinator::OwnedPartitions;
use obx_partition::partition_of;
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::pipeline::{Pipeline, Transition};

pub struct Sequencer {
    pool: PgPool,
    pipeline: Arc<Pipeline>,
    in_flight: Mutex<HashSet<String>>,
    semaphore: Arc<Semaphore>,
    claimed_by: String,
    owned_partitions: OwnedPartitions,
    /// If true, a key with any FAILED record is skipped entirely until an
    /// operator clears it. If false, the sequencer keeps dispatching later
    /// records on the key regardless of an earlier permanent failure.
    stop_on_first_failure: bool,
    /// Handles of the per-key tasks spawned by `dispatch_key`, so shutdown
    /// can wait for in-flight work to finish its current record instead of
    /// abandoning it mid-claim. A plain `std::sync::Mutex` is enough since
    /// it is only ever held for a quick push/prune, never across an await.
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Sequencer {
    pub fn new(
        pool: PgPool,
        pipeline: Arc<Pipeline>,
        claimed_by: String,
        worker_concurrency: usize,
        owned_partitions: OwnedPartitions,
        stop_on_first_failure: bool,
    ) -> Arc<Self> {
        Arc::new(Sequencer {
            pool,
            pipeline,
            in_flight: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(worker_concurrency.max(1))),
            claimed_by,
            owned_partitions,
            stop_on_first_failure,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawns a worker for `key` if and only if no worker is currently
    /// draining it. Safe to call repeatedly for the same key from the
    /// poller's tick loop — a key already in flight is a no-op.
    pub fn dispatch_key(self: &Arc<Self>, key: String) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            {
                let mut guard = this.in_flight.lock().await;
                if guard.contains(&key) {
                    return;
                }
                guard.insert(key.clone());
            }

            let permit = match this.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return, // semaphore closed during shutdown
            };

            this.drain_key(&key).await;

            drop(permit);
            this.in_flight.lock().await.remove(&key);
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Awaits every currently tracked per-key task, up to `timeout` total.
    /// Called from the shutdown path after the poller has stopped handing
    /// out new keys, so draining only has to wait out whatever was already
    /// in flight. Tasks still running when `timeout` elapses are left to
    /// finish on their own; the process exits without forcibly aborting
    /// them mid-claim.
    pub async fn drain(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        if handles.is_empty() {
            return;
        }

        let join_remaining = async {
            for handle in handles {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "a per-key dispatch task panicked during shutdown drain");
                }
            }
        };

        if tokio::time::timeout(timeout, join_remaining).await.is_err() {
            tracing::warn!("graceful shutdown timeout elapsed with per-key tasks still in flight");
        }
    }

    /// Dispatches due records for `key` one at a time, in creation order,
    /// until none remain, a FAILED record blocks further progress (when
    /// `stop_on_first_failure` is set), or this instance loses ownership of
    /// the key's partition mid-sequence (a rebalance hand-off).
    async fn drain_key(&self, key: &str) {
        let partition = partition_of(key);

        loop {
            if !self.owned_partitions.owns(partition).await {
                tracing::debug!(key, partition, "lost ownership of partition, aborting sequence");
                return;
            }

            if self.stop_on_first_failure {
                match obx_db::has_failed_record_for_key(&self.pool, key).await {
                    Ok(true) => {
                        tracing::debug!(key, "key has a permanently failed record, holding further dispatch");
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, key, "has_failed_record_for_key failed, backing off this tick");
                        return;
                    }
                }
            }

            let next = match obx_db::next_due_record_for_key(&self.pool, key).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(error = %err, key, "next_due_record_for_key failed, backing off this tick");
                    return;
                }
            };

            let claimed = match obx_db::claim_record(&self.pool, next.id, &self.claimed_by).await {
                Ok(Some(record)) => record,
                // Lost the race (another instance claimed it mid-rebalance, or it
                // was already completed) — try the key again; next_due_record_for_key
                // will naturally move past it.
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, key, "claim_record failed, backing off this tick");
                    return;
                }
            };

            match self.pipeline.process(claimed).await {
                // The head of the key advanced; there may be another due
                // record right behind it, so keep draining.
                Ok(Transition::Completed) => continue,
                // A record later in the key must never be dispatched ahead
                // of one now waiting out its retry delay or parked FAILED —
                // stop here and let the next poll tick (or, for FAILED, an
                // operator) resume the key in order.
                Ok(Transition::RetryScheduled { .. }) | Ok(Transition::Failed) => return,
                Err(err) => {
                    tracing::warn!(error = %err, key, "dispatch pipeline returned an error processing record");
                    return;
                }
            }
        }
    }
}
