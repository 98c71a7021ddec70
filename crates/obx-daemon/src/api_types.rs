//! Request and response types for all daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_ok: bool,
}

/// Request body for `POST /v1/admin/schedule`: manually enqueue a record,
/// for operator use and integration-test seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub key: String,
    #[serde(default)]
    pub context: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub id: Option<uuid::Uuid>,
    pub deduplicated: bool,
}
