//! `DispatcherConfig` rejects unknown keys outright rather than warning —
//! a typo'd field name fails config parsing instead of silently being
//! ignored. These scenarios cover that boundary plus the validation rules
//! layered on top of parsing.

use obx_config::{load_layered_yaml_from_strings, parse_and_validate, ConfigValidationError, RetryPolicyKind};

#[test]
fn unknown_top_level_key_fails_to_parse() {
    let loaded = load_layered_yaml_from_strings(&["max_gross_exposure: 1.0\n"]).unwrap();
    let result = parse_and_validate(&loaded.config_json);
    assert!(result.is_err(), "an unrecognized top-level key must fail config parsing");
}

#[test]
fn unknown_nested_key_fails_to_parse() {
    let loaded = load_layered_yaml_from_strings(&["retry:\n  policy: fixed\n  backoff_typo: 5\n"]).unwrap();
    assert!(parse_and_validate(&loaded.config_json).is_err());
}

#[test]
fn known_keys_at_every_level_parse_cleanly() {
    let yaml = r#"
poll_interval_ms: 500
worker_concurrency: 8
retry:
  policy: fixed
  initial_delay_ms: 1000
schema:
  table_prefix: "outbox_"
  initialize_on_start: true
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let config = parse_and_validate(&loaded.config_json).unwrap();
    assert_eq!(config.retry.policy, RetryPolicyKind::Fixed);
}

#[test]
fn zero_max_attempts_is_rejected_by_validation() {
    let loaded = load_layered_yaml_from_strings(&["retry:\n  max_attempts: 0\n"]).unwrap();
    let config: obx_config::DispatcherConfig = serde_json::from_value(loaded.config_json).unwrap();
    assert!(matches!(config.validate(), Err(ConfigValidationError::MaxAttemptsTooLow(0))));
}

#[test]
fn missing_sections_fall_back_to_documented_defaults() {
    let loaded = load_layered_yaml_from_strings(&["poll_interval_ms: 250\n"]).unwrap();
    let config = parse_and_validate(&loaded.config_json).unwrap();

    assert_eq!(config.poll_interval_ms, 250);
    assert_eq!(config.retry.policy, RetryPolicyKind::Exponential);
    assert_eq!(config.schema.table_prefix, "outbox_");
    assert!(config.schema.initialize_on_start);
}
