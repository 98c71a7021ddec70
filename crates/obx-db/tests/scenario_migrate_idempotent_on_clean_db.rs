//! Requires a live Postgres instance; see scenario_claim_lock_prevents_double_dispatch.rs.

use sqlx::PgPool;

#[tokio::test]
#[ignore = "requires OBX_DATABASE_URL"]
async fn migrate_twice_is_a_no_op() {
    let url = std::env::var(obx_db::ENV_DB_URL).expect("OBX_DATABASE_URL must be set for this test");
    let pool = PgPool::connect(&url).await.expect("connect");

    obx_db::migrate(&pool).await.expect("first migrate");
    obx_db::migrate(&pool).await.expect("second migrate should be idempotent");

    let status = obx_db::status(&pool).await.unwrap();
    assert!(status.ok);
    assert!(status.has_records_table);
}
