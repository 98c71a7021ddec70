//! Requires a live Postgres instance. Run with:
//!   OBX_DATABASE_URL=postgres://... cargo test -p obx-db --features dispatch-claim \
//!     --test scenario_claim_lock_prevents_double_dispatch -- --ignored

use obx_db::{claim_record, fetch_record, release_claim, schedule};
use sqlx::PgPool;

async fn make_pool() -> PgPool {
    let url = std::env::var(obx_db::ENV_DB_URL).expect("OBX_DATABASE_URL must be set for this test");
    let pool = PgPool::connect(&url).await.expect("connect");
    obx_db::migrate(&pool).await.expect("migrate");
    pool
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL; run: OBX_DATABASE_URL=postgres://... cargo test -p obx-db --features dispatch-claim -- --ignored"]
async fn only_one_dispatcher_claims_a_given_record() {
    let pool = make_pool().await;

    let id = schedule(&pool, "widget.created", serde_json::json!({"n": 1}), Some("widget-1"), Default::default(), None)
        .await
        .unwrap()
        .expect("insert should succeed");

    let first = claim_record(&pool, id, "instance-a").await.unwrap();
    assert!(first.is_some(), "first claim should succeed");

    let second = claim_record(&pool, id, "instance-b").await.unwrap();
    assert!(second.is_none(), "second claim on an already-claimed row must return None");
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn release_claim_returns_record_to_pending() {
    let pool = make_pool().await;

    let id = schedule(&pool, "widget.created", serde_json::json!({"n": 2}), Some("widget-2"), Default::default(), None)
        .await
        .unwrap()
        .unwrap();

    claim_record(&pool, id, "instance-a").await.unwrap().unwrap();
    let released = release_claim(&pool, id).await.unwrap();
    assert!(released);

    let record = fetch_record(&pool, id).await.unwrap().unwrap();
    assert_eq!(record.status, obx_schemas::RecordStatus::Pending);

    // now a different instance can claim it
    let reclaimed = claim_record(&pool, id, "instance-b").await.unwrap();
    assert!(reclaimed.is_some());
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn unclaimed_record_cannot_be_marked_completed() {
    let pool = make_pool().await;

    let id = schedule(&pool, "widget.created", serde_json::json!({"n": 3}), Some("widget-3"), Default::default(), None)
        .await
        .unwrap()
        .unwrap();

    let completed = obx_db::mark_completed(&pool, id, false).await.unwrap();
    assert!(!completed, "a PENDING record must not be markable COMPLETED without first being claimed");
}
