//! Scenario: config hash stability.
//! - same layers give the same hash and canonical JSON
//! - key order inside a document does not change the hash
//! - a changed value changes the hash
//! - an overlay layer takes effect and is reflected in the hash

use idr_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
defaults:
  agent_id: "agent-main"
  poller_id: "poller-main"
identity_reconciliation:
  enabled: true
  promotion:
    min_persistence_secs: 900
    require_hostname: true
resolver:
  chunk_size: 256
"#;

const BASE_YAML_REORDERED: &str = r#"
resolver:
  chunk_size: 256
identity_reconciliation:
  promotion:
    require_hostname: true
    min_persistence_secs: 900
  enabled: true
defaults:
  poller_id: "poller-main"
  agent_id: "agent-main"
"#;

const OVERLAY_YAML: &str = r#"
identity_reconciliation:
  promotion:
    shadow_mode: true
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
    assert_eq!(a.config_hash.len(), 64);
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();
    assert_eq!(original.config_hash, reordered.config_hash);
    assert_eq!(original.canonical_json, reordered.canonical_json);
}

#[test]
fn different_values_produce_different_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[&BASE_YAML.replace("900", "600")]).unwrap();
    assert_ne!(a.config_hash, b.config_hash);
}

#[test]
fn overlay_changes_hash_and_value() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let merged = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();
    assert_ne!(base.config_hash, merged.config_hash);

    let json = &merged.config_json;
    assert_eq!(
        json.pointer("/identity_reconciliation/promotion/shadow_mode")
            .and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        json.pointer("/identity_reconciliation/promotion/min_persistence_secs")
            .and_then(|v| v.as_u64()),
        Some(900)
    );
}
