//! Requires a live Postgres instance; see scenario_claim_lock_prevents_double_dispatch.rs.

use obx_db::schedule;
use sqlx::PgPool;

async fn make_pool() -> PgPool {
    let url = std::env::var(obx_db::ENV_DB_URL).expect("OBX_DATABASE_URL must be set for this test");
    let pool = PgPool::connect(&url).await.expect("connect");
    obx_db::migrate(&pool).await.expect("migrate");
    pool
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn same_idempotency_key_only_inserts_once() {
    let pool = make_pool().await;
    let idem = format!("order-submit-{}", uuid::Uuid::new_v4());

    let first = schedule(&pool, "order.submitted", serde_json::json!({"n": 1}), Some("order-7"), Default::default(), Some(&idem))
        .await
        .unwrap();
    let second = schedule(&pool, "order.submitted", serde_json::json!({"n": 1}), Some("order-7"), Default::default(), Some(&idem))
        .await
        .unwrap();

    assert!(first.is_some(), "first schedule with a fresh idempotency key should insert");
    assert!(second.is_none(), "second schedule with the same idempotency key should be a no-op");
}

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn missing_key_generates_a_distinct_partition_friendly_key() {
    let pool = make_pool().await;
    let id = schedule(&pool, "order.submitted", serde_json::json!({}), None, Default::default(), None)
        .await
        .unwrap()
        .unwrap();
    let record = obx_db::fetch_record(&pool, id).await.unwrap().unwrap();
    assert!(!record.key.is_empty());
}
