//! Shared test harness: a gated Postgres pool bootstrap plus a small set
//! of in-memory fake handlers that the dispatch, sequencer, and end-to-end
//! scenario tests across the workspace reuse instead of each writing their
//! own recording/flaky handler.
//!
//! Nothing here is wired into a production binary — this crate exists only
//! to be a `[dev-dependencies]` of other crates' test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use obx_schemas::{HandlerOutcome, Metadata};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Connects to `OBX_DATABASE_URL` and applies migrations, or returns `None`
/// (with a message on stderr) if the variable is unset or the connection
/// fails. Scenario tests that require a live Postgres instance call this
/// once at the top and early-return when it yields `None`, rather than
/// panicking in environments with no database configured.
pub async fn try_db_pool() -> Option<PgPool> {
    let url = match std::env::var(obx_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", obx_db::ENV_DB_URL);
            return None;
        }
    };

    match PgPool::connect(&url).await {
        Ok(pool) => match obx_db::migrate(&pool).await {
            Ok(()) => Some(pool),
            Err(e) => {
                eprintln!("SKIP: migrate failed: {e}");
                None
            }
        },
        Err(e) => {
            eprintln!("SKIP: cannot connect to DB: {e}");
            None
        }
    }
}

/// Records every payload it is invoked with, in invocation order, behind a
/// mutex so tests can assert observed order after the fact without racing
/// the handler itself. Always succeeds.
#[derive(Default)]
pub struct RecordingHandler {
    observed: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn observed(&self) -> Vec<Value> {
        self.observed.lock().await.clone()
    }
}

#[async_trait]
impl obx_handlers::Handler for RecordingHandler {
    async fn handle(&self, payload: Value, _metadata: Metadata) -> HandlerOutcome {
        self.observed.lock().await.push(payload);
        HandlerOutcome::Success
    }
}

/// Fails with a retryable error the first `fail_times` invocations, then
/// succeeds. Used for "retry then success" scenarios without hand-rolling
/// an atomic counter in every test file.
pub struct FlakyHandler {
    fail_times: usize,
    attempts: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(fail_times: usize) -> Arc<Self> {
        Arc::new(FlakyHandler { fail_times, attempts: AtomicUsize::new(0) })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl obx_handlers::Handler for FlakyHandler {
    async fn handle(&self, _payload: Value, _metadata: Metadata) -> HandlerOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            HandlerOutcome::Retryable(anyhow::anyhow!("flaky handler failing on attempt {attempt}"))
        } else {
            HandlerOutcome::Success
        }
    }
}

/// Always raises a non-retryable error. Used for permanent-failure and
/// fallback-recovery scenarios.
pub struct AlwaysNonRetryableHandler;

#[async_trait]
impl obx_handlers::Handler for AlwaysNonRetryableHandler {
    async fn handle(&self, _payload: Value, _metadata: Metadata) -> HandlerOutcome {
        HandlerOutcome::NonRetryable(anyhow::anyhow!("always-fails test handler"))
    }
}

/// A fallback handler that records every failure context it was invoked
/// with and always recovers (returns `Ok`).
#[derive(Default)]
pub struct RecoveringFallbackHandler {
    failures: Mutex<Vec<obx_schemas::FailureContext>>,
}

impl RecoveringFallbackHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn failures(&self) -> Vec<obx_schemas::FailureContext> {
        self.failures.lock().await.clone()
    }
}

#[async_trait]
impl obx_handlers::FallbackHandler for RecoveringFallbackHandler {
    async fn handle_failure(&self, _payload: Value, failure: obx_schemas::FailureContext) -> anyhow::Result<()> {
        self.failures.lock().await.push(failure);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn metadata() -> Metadata {
        Metadata {
            record_id: Uuid::new_v4(),
            key: "k".into(),
            payload_type: "t".into(),
            attempt: 1,
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn recording_handler_preserves_invocation_order() {
        use obx_handlers::Handler;
        let handler = RecordingHandler::new();
        for v in ["a", "b", "c"] {
            handler.handle(Value::String(v.to_string()), metadata()).await;
        }
        let observed = handler.observed().await;
        assert_eq!(observed, vec![Value::String("a".into()), Value::String("b".into()), Value::String("c".into())]);
    }

    #[tokio::test]
    async fn flaky_handler_succeeds_after_fail_times() {
        use obx_handlers::Handler;
        let handler = FlakyHandler::new(2);
        assert!(!handler.handle(Value::Null, metadata()).await.is_success());
        assert!(!handler.handle(Value::Null, metadata()).await.is_success());
        assert!(handler.handle(Value::Null, metadata()).await.is_success());
        assert_eq!(handler.attempts(), 3);
    }

    #[tokio::test]
    async fn recovering_fallback_records_every_failure() {
        use obx_handlers::FallbackHandler;
        let fallback = RecoveringFallbackHandler::new();
        let failure = obx_schemas::FailureContext {
            record_id: Uuid::new_v4(),
            key: "k".into(),
            payload_type: "t".into(),
            attempt: 4,
            failure_count: 1,
            last_error: "boom".into(),
            context: Default::default(),
        };
        fallback.handle_failure(Value::Null, failure.clone()).await.unwrap();
        assert_eq!(fallback.failures().await, vec![failure]);
    }
}
