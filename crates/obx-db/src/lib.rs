// crates/obx-db/src/lib.rs
//! Postgres-backed Record Store (C1) and Instance Registry (C2).
//!
//! Every function here takes an executor rather than assuming a pool, so
//! `schedule` can run inside the producer's own transaction — the whole
//! point of the outbox pattern is that the record write and the business
//! write commit or roll back together.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use obx_partition::partition_of;
use obx_schemas::{Context as RecordContext, Record, RecordStatus};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "OBX_DATABASE_URL";

/// Connect to Postgres using OBX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper: connect using OBX_DATABASE_URL and ensure migrations are
/// applied before handing back the pool.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_records_table: bool,
}

/// Connectivity + schema-presence check, used by the daemon's health
/// endpoint and the CLI's `db status` command.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'outbox_records'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus { ok: one == 1, has_records_table: exists })
}

fn row_to_record(row: sqlx::postgres::PgRow) -> Result<Record> {
    let status: String = row.try_get("status")?;
    let context_json: Value = row.try_get("context")?;
    let context: RecordContext =
        serde_json::from_value(context_json).context("failed to decode record context")?;

    Ok(Record {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        partition: row.try_get("partition")?,
        payload_type: row.try_get("payload_type")?,
        payload: row.try_get("payload")?,
        context,
        status: parse_status(&status)?,
        attempt: row.try_get("attempt")?,
        failure_count: row.try_get("failure_count")?,
        available_at: row.try_get("available_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn parse_status(s: &str) -> Result<RecordStatus> {
    Ok(match s {
        "PENDING" => RecordStatus::Pending,
        "CLAIMED" => RecordStatus::Claimed,
        "RETRY_SCHEDULED" => RecordStatus::RetryScheduled,
        "COMPLETED" => RecordStatus::Completed,
        "FAILED" => RecordStatus::Failed,
        other => anyhow::bail!("invalid record status in row: {other}"),
    })
}

/// Producer API: schedule a record for dispatch.
///
/// `executor` is anything sqlx can run a query against — a bare `&PgPool`
/// or a `&mut PgConnection` borrowed from the producer's own open
/// transaction, so the insert commits or rolls back with the producer's
/// business write as the outbox pattern requires. An absent `key`
/// generates a fresh UUIDv4 so the record still gets a deterministic,
/// independently-ordered partition. An absent `idempotency_key` means the
/// call is not deduplicated — callers that need at-most-once enqueue
/// should pass one.
pub async fn schedule<'e, E>(
    executor: E,
    payload_type: &str,
    payload: Value,
    key: Option<&str>,
    context: RecordContext,
    idempotency_key: Option<&str>,
) -> Result<Option<Uuid>>
where
    E: sqlx::PgExecutor<'e>,
{
    let id = Uuid::new_v4();
    let key = key.map(str::to_string).unwrap_or_else(|| Uuid::new_v4().to_string());
    let partition = partition_of(&key) as i16;
    let context_json = serde_json::to_value(&context).context("failed to encode record context")?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into outbox_records (id, key, partition, payload_type, payload, context, idempotency_key)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (idempotency_key) do nothing
        returning id
        "#,
    )
    .bind(id)
    .bind(&key)
    .bind(partition)
    .bind(payload_type)
    .bind(payload)
    .bind(context_json)
    .bind(idempotency_key)
    .fetch_optional(executor)
    .await
    .context("schedule failed")?;

    Ok(row.map(|(id,)| id))
}

/// Returns up to `limit` distinct keys, restricted to `owned_partitions`,
/// that have at least one PENDING or RETRY_SCHEDULED record whose
/// `available_at` has passed. This is the Poller's (C5) main query.
pub async fn keys_with_due_records(
    pool: &PgPool,
    owned_partitions: &[i16],
    limit: i64,
) -> Result<Vec<String>> {
    if owned_partitions.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        select key
        from outbox_records
        where status in ('PENDING', 'RETRY_SCHEDULED')
          and available_at <= now()
          and partition = any($1)
        group by key
        order by min(created_at) asc
        limit $2
        "#,
    )
    .bind(owned_partitions)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("keys_with_due_records failed")?;

    rows.into_iter().map(|r| r.try_get::<String, _>("key").map_err(Into::into)).collect()
}

/// Returns whether `key` currently has any record in FAILED status. The
/// key-sequencer consults this before dispatching the next record for a
/// key: a prior permanent failure blocks further dispatch on that key
/// until an operator clears it, preserving per-key order.
pub async fn has_failed_record_for_key(pool: &PgPool, key: &str) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from outbox_records where key = $1 and status = 'FAILED'
        )
        "#,
    )
    .bind(key)
    .fetch_one(pool)
    .await
    .context("has_failed_record_for_key failed")?;
    Ok(exists)
}

/// Returns the single oldest due record for `key`, if any, without
/// claiming it. Used by the key-sequencer to decide whether there is
/// work to dispatch before acquiring the per-key slot.
pub async fn next_due_record_for_key(pool: &PgPool, key: &str) -> Result<Option<Record>> {
    let row = sqlx::query(
        r#"
        select id, key, partition, payload_type, payload, context, status, attempt,
               failure_count, available_at, created_at, updated_at, completed_at,
               claimed_by, claimed_at, last_error
        from outbox_records
        where key = $1
          and status in ('PENDING', 'RETRY_SCHEDULED')
          and available_at <= now()
        order by created_at asc
        limit 1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("next_due_record_for_key failed")?;

    row.map(row_to_record).transpose()
}

#[cfg(feature = "dispatch-claim")]
mod claim {
    use super::*;

    /// Atomically claims a single due record by id, transitioning it to
    /// CLAIMED. Uses `FOR UPDATE SKIP LOCKED` so a concurrent dispatcher
    /// (on this or another instance, during a rebalance race) never
    /// claims the same row twice. Returns `None` if the record is no
    /// longer PENDING/RETRY_SCHEDULED (already claimed elsewhere, or
    /// completed) by the time this runs.
    ///
    /// Gated behind `dispatch-claim` so only the dispatch pipeline can
    /// call it — the CLI and daemon's own status/health code depend on
    /// this crate without the feature, so attempting to claim from those
    /// surfaces fails to compile rather than racing the real dispatcher.
    pub async fn claim_record(pool: &PgPool, record_id: Uuid, claimed_by: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            r#"
            with to_claim as (
                select id
                from outbox_records
                where id = $1
                  and status in ('PENDING', 'RETRY_SCHEDULED')
                for update skip locked
            )
            update outbox_records
               set status = 'CLAIMED',
                   attempt = attempt + 1,
                   claimed_by = $2,
                   claimed_at = now(),
                   updated_at = now()
             where id in (select id from to_claim)
            returning id, key, partition, payload_type, payload, context, status, attempt,
                      failure_count, available_at, created_at, updated_at, completed_at,
                      claimed_by, claimed_at, last_error
            "#,
        )
        .bind(record_id)
        .bind(claimed_by)
        .fetch_optional(pool)
        .await
        .context("claim_record failed")?;

        row.map(row_to_record).transpose()
    }

    /// Releases a CLAIMED record back to PENDING without changing
    /// `attempt` or `failure_count`. Used when an instance loses
    /// ownership of a partition mid-dispatch (OwnershipLost) so another
    /// instance can pick the record back up immediately.
    pub async fn release_claim(pool: &PgPool, record_id: Uuid) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update outbox_records
               set status = 'PENDING',
                   claimed_by = null,
                   claimed_at = null,
                   updated_at = now()
             where id = $1
               and status = 'CLAIMED'
            returning id
            "#,
        )
        .bind(record_id)
        .fetch_optional(pool)
        .await
        .context("release_claim failed")?;
        Ok(row.is_some())
    }
}

#[cfg(feature = "dispatch-claim")]
pub use claim::{claim_record, release_claim};

/// Marks a CLAIMED record COMPLETED. Deletes the row in the same
/// statement when `delete_on_complete` is true, keeping the "mark
/// completed" contract a single atomic operation rather than a
/// mark-then-sweep pair. Returns true if a row transitioned.
pub async fn mark_completed(pool: &PgPool, record_id: Uuid, delete_on_complete: bool) -> Result<bool> {
    if delete_on_complete {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            delete from outbox_records
            where id = $1 and status = 'CLAIMED'
            returning id
            "#,
        )
        .bind(record_id)
        .fetch_optional(pool)
        .await
        .context("mark_completed (delete) failed")?;
        return Ok(row.is_some());
    }

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update outbox_records
           set status = 'COMPLETED',
               completed_at = now(),
               updated_at = now()
         where id = $1
           and status = 'CLAIMED'
        returning id
        "#,
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await
    .context("mark_completed failed")?;
    Ok(row.is_some())
}

/// Schedules a retry: CLAIMED -> RETRY_SCHEDULED with a new `available_at`
/// and incremented `failure_count`. Returns true if a row transitioned.
pub async fn schedule_retry(
    pool: &PgPool,
    record_id: Uuid,
    available_at: DateTime<Utc>,
    error: &str,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update outbox_records
           set status = 'RETRY_SCHEDULED',
               failure_count = failure_count + 1,
               available_at = $2,
               last_error = $3,
               updated_at = now()
         where id = $1
           and status = 'CLAIMED'
        returning id
        "#,
    )
    .bind(record_id)
    .bind(available_at)
    .bind(error)
    .fetch_optional(pool)
    .await
    .context("schedule_retry failed")?;
    Ok(row.is_some())
}

/// Marks a CLAIMED record permanently FAILED (fallback exhausted or
/// itself errored). `increment_failure_count` follows the decision made
/// by the retry policy engine: a record that never occupied a retry slot
/// (non-retryable error, straight to fallback) does not increment.
pub async fn mark_failed_permanent(
    pool: &PgPool,
    record_id: Uuid,
    error: &str,
    increment_failure_count: bool,
) -> Result<bool> {
    let row: Option<(Uuid,)> = if increment_failure_count {
        sqlx::query_as(
            r#"
            update outbox_records
               set status = 'FAILED',
                   failure_count = failure_count + 1,
                   last_error = $2,
                   updated_at = now()
             where id = $1
               and status = 'CLAIMED'
            returning id
            "#,
        )
        .bind(record_id)
        .bind(error)
        .fetch_optional(pool)
        .await
    } else {
        sqlx::query_as(
            r#"
            update outbox_records
               set status = 'FAILED',
                   last_error = $2,
                   updated_at = now()
             where id = $1
               and status = 'CLAIMED'
            returning id
            "#,
        )
        .bind(record_id)
        .bind(error)
        .fetch_optional(pool)
        .await
    }
    .context("mark_failed_permanent failed")?;
    Ok(row.is_some())
}

/// Fetches a single record by id, regardless of status.
pub async fn fetch_record(pool: &PgPool, record_id: Uuid) -> Result<Option<Record>> {
    let row = sqlx::query(
        r#"
        select id, key, partition, payload_type, payload, context, status, attempt,
               failure_count, available_at, created_at, updated_at, completed_at,
               claimed_by, claimed_at, last_error
        from outbox_records
        where id = $1
        "#,
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await
    .context("fetch_record failed")?;

    row.map(row_to_record).transpose()
}

// ---------------------------------------------------------------------------
// Instance Registry (C2)
// ---------------------------------------------------------------------------

/// Registers (or re-registers) this instance as LIVE. Upsert so a
/// restarting instance with the same id simply resumes rather than racing
/// its own stale row.
pub async fn register_instance(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        insert into outbox_instances (instance_id, status, last_heartbeat, registered_at)
        values ($1, 'LIVE', now(), now())
        on conflict (instance_id) do update
            set status = 'LIVE',
                last_heartbeat = now()
        "#,
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("register_instance failed")?;
    Ok(())
}

/// Refreshes this instance's heartbeat. Called on every coordinator
/// heartbeat tick.
pub async fn update_heartbeat(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        update outbox_instances
           set last_heartbeat = now()
         where instance_id = $1
        "#,
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("update_heartbeat failed")?;
    Ok(())
}

/// Marks this instance DRAINING: it remains visible to `list_live` (so
/// other instances see it and can recompute ownership) but signals it is
/// shutting down. Called at the start of graceful shutdown.
pub async fn mark_draining(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        update outbox_instances
           set status = 'DRAINING'
         where instance_id = $1
        "#,
    )
    .bind(instance_id)
    .execute(pool)
    .await
    .context("mark_draining failed")?;
    Ok(())
}

/// Deletes this instance's row. Called at the end of graceful shutdown,
/// after drain completes, so its former partitions are immediately
/// reassignable.
pub async fn delete_instance(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query("delete from outbox_instances where instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await
        .context("delete_instance failed")?;
    Ok(())
}

/// Lists all instances considered live: status = LIVE and a heartbeat
/// newer than `stale_after`. DRAINING instances are excluded from
/// ownership computation even if their heartbeat is fresh, since they
/// have already announced they are leaving.
pub async fn list_live(pool: &PgPool, stale_after: DateTime<Utc>) -> Result<Vec<obx_schemas::Instance>> {
    let rows = sqlx::query(
        r#"
        select instance_id, status, last_heartbeat, registered_at
        from outbox_instances
        where status = 'LIVE'
          and last_heartbeat >= $1
        order by instance_id asc
        "#,
    )
    .bind(stale_after)
    .fetch_all(pool)
    .await
    .context("list_live failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(obx_schemas::Instance {
                instance_id: row.try_get("instance_id")?,
                status: obx_schemas::InstanceStatus::Live,
                last_heartbeat: row.try_get("last_heartbeat")?,
                registered_at: row.try_get("registered_at")?,
            })
        })
        .collect()
}

/// Deletes instance rows whose heartbeat is older than `stale_before`.
/// Returns the number of rows reaped. Called periodically by the
/// coordinator's reap task to clean up crashed instances that never got
/// to run graceful shutdown.
pub async fn reap_stale(pool: &PgPool, stale_before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("delete from outbox_instances where last_heartbeat < $1")
        .bind(stale_before)
        .execute(pool)
        .await
        .context("reap_stale failed")?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RecordStatusCounts {
    pub pending: i64,
    pub claimed: i64,
    pub retry_scheduled: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Counts of every record by status, across the whole table (not limited
/// to this instance's owned partitions) — feeds the daemon's `/v1/status`
/// endpoint.
pub async fn record_status_counts(pool: &PgPool) -> Result<RecordStatusCounts> {
    let rows = sqlx::query("select status, count(*) as n from outbox_records group by status")
        .fetch_all(pool)
        .await
        .context("record_status_counts failed")?;

    let mut counts = RecordStatusCounts::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        match status.as_str() {
            "PENDING" => counts.pending = n,
            "CLAIMED" => counts.claimed = n,
            "RETRY_SCHEDULED" => counts.retry_scheduled = n,
            "COMPLETED" => counts.completed = n,
            "FAILED" => counts.failed = n,
            _ => {}
        }
    }
    Ok(counts)
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PendingRecordStats {
    pub count_by_key: i64,
    pub max_pending_per_key: i64,
    pub avg_pending_per_key: f64,
}

/// Sum/max/avg of due (PENDING or RETRY_SCHEDULED, available now) records
/// per key, restricted to `owned_partitions` — the per-instance backlog
/// shape the daemon reports alongside the cluster-wide status counts.
pub async fn pending_record_stats(pool: &PgPool, owned_partitions: &[i16]) -> Result<PendingRecordStats> {
    if owned_partitions.is_empty() {
        return Ok(PendingRecordStats::default());
    }

    let row = sqlx::query(
        r#"
        select
            coalesce(max(n), 0)::bigint as max_per_key,
            coalesce(avg(n), 0)::float8 as avg_per_key,
            count(*)::bigint as keys_with_backlog
        from (
            select key, count(*) as n
            from outbox_records
            where status in ('PENDING', 'RETRY_SCHEDULED')
              and available_at <= now()
              and partition = any($1)
            group by key
        ) per_key
        "#,
    )
    .bind(owned_partitions)
    .fetch_one(pool)
    .await
    .context("pending_record_stats failed")?;

    Ok(PendingRecordStats {
        count_by_key: row.try_get("keys_with_backlog")?,
        max_pending_per_key: row.try_get("max_per_key")?,
        avg_pending_per_key: row.try_get("avg_per_key")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_round_trips_known_values() {
        for s in ["PENDING", "CLAIMED", "RETRY_SCHEDULED", "COMPLETED", "FAILED"] {
            assert!(parse_status(s).is_ok(), "expected {s} to parse");
        }
        assert!(parse_status("BOGUS").is_err());
    }
}
