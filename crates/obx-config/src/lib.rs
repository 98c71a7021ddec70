//! Configuration surface: a typed `DispatcherConfig` covering every
//! field the dispatcher's operators can set, plus the layered-file loader
//! and hash used to fingerprint a running configuration.
//!
//! The loader is deliberately dumb about the *shape* of what it loads — it
//! merges arbitrary YAML documents into one JSON value and hashes the
//! canonical form — so the same machinery serves both `DispatcherConfig`
//! and any ad hoc config an operator wants to layer and fingerprint (e.g.
//! from the CLI's `config hash` command).

use std::fs;
use std::time::Duration;

use obx_retry::{Backoff, Jitter, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Layered YAML loading + canonical hashing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load + deep-merge YAML files in order (later files override earlier
/// ones), then canonicalize to a stable-key-order JSON string and hash it.
pub fn load_layered_yaml(paths: &[&str]) -> anyhow::Result<LoadedConfig> {
    let mut sources = Vec::with_capacity(paths.len());
    for p in paths {
        let s = fs::read_to_string(p).map_err(|e| anyhow::anyhow!("read config {p}: {e}"))?;
        sources.push(s);
    }
    let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

/// Same as [`load_layered_yaml`] but takes YAML document bodies directly,
/// so tests don't need files on disk.
pub fn load_layered_yaml_from_strings(docs: &[&str]) -> anyhow::Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for doc in docs {
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(doc).map_err(|e| anyhow::anyhow!("parse yaml: {e}"))?;
        let json_val =
            serde_json::to_value(yaml_val).map_err(|e| anyhow::anyhow!("yaml->json conversion failed: {e}"))?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).expect("canonical json must reparse"),
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Deep-merge: objects merge recursively; arrays and scalars are replaced
/// wholesale by the later document.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Sorts every object's keys recursively, then serializes compactly, so two
/// documents differing only in key order hash identically.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig (configuration surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "defaults::rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: i64,
    #[serde(default = "defaults::worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "defaults::heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "defaults::stale_instance_timeout_sec")]
    pub stale_instance_timeout_sec: u64,
    #[serde(default = "defaults::graceful_shutdown_timeout_sec")]
    pub graceful_shutdown_timeout_sec: u64,

    #[serde(default)]
    pub stop_on_first_failure: bool,
    #[serde(default)]
    pub delete_completed_records: bool,
    #[serde(default)]
    pub publish_after_save: bool,

    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            poll_interval_ms: defaults::poll_interval_ms(),
            rebalance_interval_ms: defaults::rebalance_interval_ms(),
            batch_size: defaults::batch_size(),
            worker_concurrency: defaults::worker_concurrency(),
            heartbeat_interval_sec: defaults::heartbeat_interval_sec(),
            stale_instance_timeout_sec: defaults::stale_instance_timeout_sec(),
            graceful_shutdown_timeout_sec: defaults::graceful_shutdown_timeout_sec(),
            stop_on_first_failure: false,
            delete_completed_records: false,
            publish_after_save: false,
            retry: RetryConfig::default(),
            schema: SchemaConfig::default(),
        }
    }
}

mod defaults {
    pub fn poll_interval_ms() -> u64 {
        500
    }
    pub fn rebalance_interval_ms() -> u64 {
        5_000
    }
    pub fn batch_size() -> i64 {
        256
    }
    pub fn worker_concurrency() -> usize {
        8
    }
    pub fn heartbeat_interval_sec() -> u64 {
        5
    }
    pub fn stale_instance_timeout_sec() -> u64 {
        30
    }
    pub fn graceful_shutdown_timeout_sec() -> u64 {
        30
    }
    pub fn max_attempts() -> u32 {
        5
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "retry_defaults::policy")]
    pub policy: RetryPolicyKind,
    #[serde(default = "retry_defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "retry_defaults::increment_ms")]
    pub increment_ms: u64,
    #[serde(default = "retry_defaults::multiplier")]
    pub multiplier: f64,
    #[serde(default = "retry_defaults::max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default)]
    pub include_exceptions: Vec<String>,
    #[serde(default)]
    pub exclude_exceptions: Vec<String>,
}

mod retry_defaults {
    use super::RetryPolicyKind;
    pub fn policy() -> RetryPolicyKind {
        RetryPolicyKind::Exponential
    }
    pub fn initial_delay_ms() -> u64 {
        1_000
    }
    pub fn increment_ms() -> u64 {
        1_000
    }
    pub fn multiplier() -> f64 {
        2.0
    }
    pub fn max_delay_ms() -> u64 {
        60_000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            policy: retry_defaults::policy(),
            initial_delay_ms: retry_defaults::initial_delay_ms(),
            increment_ms: retry_defaults::increment_ms(),
            multiplier: retry_defaults::multiplier(),
            max_delay_ms: retry_defaults::max_delay_ms(),
            max_attempts: defaults::max_attempts(),
            jitter_ms: 0,
            include_exceptions: Vec::new(),
            exclude_exceptions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    #[serde(default = "schema_defaults::table_prefix")]
    pub table_prefix: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default = "schema_defaults::initialize_on_start")]
    pub initialize_on_start: bool,
}

mod schema_defaults {
    pub fn table_prefix() -> String {
        "outbox_".to_string()
    }
    pub fn initialize_on_start() -> bool {
        true
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            table_prefix: schema_defaults::table_prefix(),
            schema_name: None,
            initialize_on_start: schema_defaults::initialize_on_start(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("retry.max_attempts must be >= 1, got {0}")]
    MaxAttemptsTooLow(u32),
    #[error("retry.multiplier must be > 1 for an exponential policy, got {0}")]
    MultiplierTooLow(f64),
    #[error("retry.initial_delay_ms must be > 0, got {0}")]
    NonPositiveDelay(u64),
    #[error("worker_concurrency must be >= 1, got {0}")]
    WorkerConcurrencyTooLow(usize),
    #[error("poll_interval_ms must be > 0")]
    NonPositivePollInterval,
    #[error("stale_instance_timeout_sec ({stale}) must be greater than heartbeat_interval_sec ({heartbeat})")]
    StaleTimeoutNotGreaterThanHeartbeat { stale: u64, heartbeat: u64 },
}

impl DispatcherConfig {
    /// Validates the fields the build-time rules cover, plus the
    /// cross-field sanity checks a misconfigured cluster would otherwise
    /// only discover at runtime (e.g. a stale timeout shorter than the
    /// heartbeat interval would reap every instance on every tick).
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigValidationError::WorkerConcurrencyTooLow(self.worker_concurrency));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigValidationError::NonPositivePollInterval);
        }
        if self.stale_instance_timeout_sec <= self.heartbeat_interval_sec {
            return Err(ConfigValidationError::StaleTimeoutNotGreaterThanHeartbeat {
                stale: self.stale_instance_timeout_sec,
                heartbeat: self.heartbeat_interval_sec,
            });
        }
        self.retry.validate()?;
        Ok(())
    }

    /// Builds the `obx-retry` policy this configuration describes.
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = match self.retry.policy {
            RetryPolicyKind::Fixed => Backoff::Fixed { delay_ms: self.retry.initial_delay_ms },
            RetryPolicyKind::Linear => {
                Backoff::Linear { base_ms: self.retry.initial_delay_ms, increment_ms: self.retry.increment_ms }
            }
            RetryPolicyKind::Exponential => Backoff::Exponential {
                base_ms: self.retry.initial_delay_ms,
                multiplier: self.retry.multiplier,
                max_ms: self.retry.max_delay_ms,
            },
        };
        let jitter = if self.retry.jitter_ms == 0 { Jitter::None } else { Jitter::Equal };
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff,
            jitter,
            retry_on: self.retry.include_exceptions.clone(),
            no_retry_on: self.retry.exclude_exceptions.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn stale_instance_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_instance_timeout_sec)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_sec)
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_attempts < 1 {
            return Err(ConfigValidationError::MaxAttemptsTooLow(self.max_attempts));
        }
        if self.initial_delay_ms == 0 {
            return Err(ConfigValidationError::NonPositiveDelay(self.initial_delay_ms));
        }
        if self.policy == RetryPolicyKind::Exponential && self.multiplier <= 1.0 {
            return Err(ConfigValidationError::MultiplierTooLow(self.multiplier));
        }
        Ok(())
    }
}

/// Parses a fully-specified `DispatcherConfig` out of an already-merged
/// JSON value (typically `LoadedConfig::config_json`), then validates it.
pub fn parse_and_validate(config_json: &Value) -> anyhow::Result<DispatcherConfig> {
    let config: DispatcherConfig =
        serde_json::from_value(config_json.clone()).map_err(|e| anyhow::anyhow!("invalid dispatcher config: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}
