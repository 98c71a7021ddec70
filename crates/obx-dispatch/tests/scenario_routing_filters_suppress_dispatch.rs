//! Requires a live Postgres instance. Run with:
//!   OBX_DATABASE_URL=postgres://... cargo test -p obx-dispatch \
//!     --test scenario_routing_filters_suppress_dispatch -- --ignored

use std::sync::Arc;

use obx_dispatch::{Pipeline, Transition};
use obx_handlers::HandlerRegistry;
use obx_retry::{Backoff, Jitter, RetryPolicy};
use obx_routing::{RoutingRule, RoutingTable, Selector};
use sqlx::PgPool;

async fn make_pool() -> PgPool {
    let url = std::env::var(obx_db::ENV_DB_URL).expect("OBX_DATABASE_URL must be set for this test");
    let pool = PgPool::connect(&url).await.expect("connect");
    obx_db::migrate(&pool).await.expect("migrate");
    pool
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn filtered_rule_completes_record_without_invoking_any_handler() {
    let pool = make_pool().await;

    // No handler registered at all for "audit.ping" — if the pipeline tried
    // to dispatch it, this would resolve to NonRetryable and fail the record.
    let routing = RoutingTable::new(vec![
        RoutingRule::new("suppress-audit-ping", Selector::PayloadType("audit.ping".into()), "audit.ping")
            .filtered_out(),
    ]);

    let pipeline = Pipeline {
        pool: pool.clone(),
        handlers: Arc::new(HandlerRegistry::new()),
        routing: Arc::new(routing),
        default_retry_policy: RetryPolicy {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 1 },
            jitter: Jitter::None,
            retry_on: vec![],
            no_retry_on: vec![],
        },
        classifier: None,
        delete_on_complete: false,
    };

    let id = obx_db::schedule(&pool, "audit.ping", serde_json::json!({}), Some("ping-1"), Default::default(), None)
        .await
        .unwrap()
        .unwrap();
    let record = obx_db::claim_record(&pool, id, "instance-a").await.unwrap().unwrap();

    let transition = pipeline.process(record).await.unwrap();
    assert_eq!(transition, Transition::Completed);

    let stored = obx_db::fetch_record(&pool, id).await.unwrap().unwrap();
    assert_eq!(stored.status, obx_schemas::RecordStatus::Completed);
}
