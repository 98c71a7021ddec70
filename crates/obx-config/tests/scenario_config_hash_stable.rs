//! Validates that layered YAML loading produces a stable, canonical hash:
//! same input hashes identically, key order doesn't matter, and different
//! values produce different hashes.

use obx_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
poll_interval_ms: 500
worker_concurrency: 8
retry:
  policy: exponential
  max_attempts: 5
schema:
  table_prefix: "outbox_"
"#;

const BASE_YAML_REORDERED: &str = r#"
retry:
  max_attempts: 5
  policy: exponential
schema:
  table_prefix: "outbox_"
worker_concurrency: 8
poll_interval_ms: 500
"#;

const OVERLAY_YAML: &str = r#"
poll_interval_ms: 100
retry:
  max_attempts: 8
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same YAML input must produce identical hash");
    assert_eq!(a.canonical_json, b.canonical_json, "canonical JSON must be identical for same input");
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(original.config_hash, reordered.config_hash, "reordering keys must not change the hash");
    assert_eq!(original.canonical_json, reordered.canonical_json);
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let modified = "poll_interval_ms: 500\nworker_concurrency: 16\n";
    let b = load_layered_yaml_from_strings(&[modified]).unwrap();

    assert_ne!(a.config_hash, b.config_hash, "different config values must produce different hashes");
}

#[test]
fn merged_layers_override_deterministically() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "same merge layers must produce identical hash");

    assert_eq!(a.config_json.pointer("/poll_interval_ms").and_then(|v| v.as_i64()), Some(100));
    assert_eq!(a.config_json.pointer("/retry/max_attempts").and_then(|v| v.as_i64()), Some(8));
    // untouched by the overlay
    assert_eq!(a.config_json.pointer("/worker_concurrency").and_then(|v| v.as_i64()), Some(8));
}

#[test]
fn hash_is_64_hex_chars() {
    let loaded = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(loaded.config_hash.len(), 64, "SHA-256 hash should be 64 hex chars");
    assert!(loaded.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn empty_config_produces_stable_hash() {
    let a = load_layered_yaml_from_strings(&["{}"]).unwrap();
    let b = load_layered_yaml_from_strings(&["{}"]).unwrap();

    assert_eq!(a.config_hash, b.config_hash, "empty configs must produce identical hash");
}
