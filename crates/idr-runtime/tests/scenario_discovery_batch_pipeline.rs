//! Scenario: discovery batches through the identity engine.
//! - a known MAC enriches an update with its canonical device id
//! - an unknown address becomes a sighting instead of a device
//! - conflicting keys keep the higher-priority winner and write a merge row
//! - with reconciliation disabled, misses pass through unchanged
//! - a missing agent id only skips the sweep config write

use std::sync::Arc;

use chrono::Utc;
use idr_audit::{AuditLog, AuditQuery, AuditRecord, AuditSink};
use idr_config::ResolvedSource;
use idr_kv::MemoryKvStore;
use idr_resolver::{CanonicalPublisher, PublisherSettings};
use idr_runtime::{
    sweep_config_path, ConfigWriteError, EngineSettings, IdentityEngine,
    MERGE_REASON_IDENTITY_CONFLICT,
};
use idr_schemas::{meta, sources, DeviceUpdate};
use tokio_util::sync::CancellationToken;

fn armis(ip: &str) -> DeviceUpdate {
    DeviceUpdate::observed(sources::ARMIS, "default", ip, Utc::now())
}

async fn seed(store: &Arc<MemoryKvStore>) {
    let mut a = armis("10.0.0.1");
    a.device_id = "sr:a".to_string();
    a.mac = Some("AA-BB-CC-00-00-01".to_string());
    let mut b = armis("10.0.0.2");
    b.device_id = "sr:b".to_string();
    b.hostname = Some("printer-2".to_string());

    let publisher = CanonicalPublisher::new(store.clone(), PublisherSettings::default());
    let report = publisher
        .publish(&CancellationToken::new(), &[a, b], Utc::now())
        .await;
    assert_eq!(report.failed, 0);
    assert!(report.created >= 3);
}

fn enabled() -> EngineSettings {
    let mut s = EngineSettings::default();
    s.reconciliation_enabled = true;
    s
}

#[tokio::test]
async fn hits_enrich_and_misses_become_sightings() {
    let store = Arc::new(MemoryKvStore::new());
    seed(&store).await;
    let audit = Arc::new(AuditLog::in_memory());
    let engine = IdentityEngine::new(store.clone(), audit.clone(), enabled());

    let mut known = armis("10.0.0.77");
    known.mac = Some("aa:bb:cc:00:00:01".to_string());
    let unknown = armis("10.0.0.99");
    let mut gone = armis("10.0.0.1");
    gone.is_available = false;
    gone.metadata.insert(meta::DELETED.to_string(), "true".to_string());

    let out = engine
        .process_batch(&CancellationToken::new(), vec![known, unknown, gone], Utc::now())
        .await;

    assert_eq!(out.resolved, 1);
    assert_eq!(out.sighting_ids.len(), 1);
    assert_eq!(out.updates.len(), 2);
    assert_eq!(out.updates[0].device_id, "sr:a");
    assert_eq!(
        out.updates[0].metadata.get(meta::CANONICAL_DEVICE_ID).map(String::as_str),
        Some("sr:a")
    );
    assert!(out.updates[1].is_retraction());
    assert!(out.resolve_error.is_none());

    let listed = engine.list_sightings(None, 0, 0);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].ip, "10.0.0.99");
    assert_eq!(engine.count_sightings(Some("default")), 1);
}

#[tokio::test]
async fn conflicting_keys_are_tagged_and_audited_once() {
    let store = Arc::new(MemoryKvStore::new());
    seed(&store).await;
    let audit = Arc::new(AuditLog::in_memory());
    let engine = IdentityEngine::new(store.clone(), audit.clone(), enabled());

    let mut both = armis("10.0.0.50");
    both.mac = Some("aa:bb:cc:00:00:01".to_string());
    both.hostname = Some("PRINTER-2".to_string());

    let out = engine
        .process_batch(
            &CancellationToken::new(),
            vec![both.clone(), both],
            Utc::now(),
        )
        .await;
    assert_eq!(out.resolved, 2);
    assert_eq!(out.conflicts, 2);
    assert_eq!(out.updates[0].device_id, "sr:a");
    assert_eq!(
        out.updates[0].metadata.get(meta::IDENTITY_CONFLICT).map(String::as_str),
        Some("sr:b")
    );

    let rows = audit.query(&AuditQuery {
        device_id: Some("sr:b".to_string()),
        ..AuditQuery::default()
    });
    assert_eq!(rows.len(), 1);
    match &rows[0] {
        AuditRecord::Merge(m) => {
            assert_eq!(m.reason, MERGE_REASON_IDENTITY_CONFLICT);
            assert_eq!(m.from_device_id, "sr:b");
            assert_eq!(m.to_device_id, "sr:a");
            assert_eq!(m.confidence_score, Some(0.9));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn disabled_reconciliation_passes_misses_through() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = IdentityEngine::new(
        store,
        Arc::new(AuditLog::in_memory()),
        EngineSettings::default(),
    );
    let out = engine
        .process_batch(&CancellationToken::new(), vec![armis("10.0.0.5")], Utc::now())
        .await;
    assert_eq!(out.updates.len(), 1);
    assert_eq!(out.updates[0].device_id, "");
    assert!(out.sighting_ids.is_empty());
    assert_eq!(engine.count_sightings(None), 0);
}

#[tokio::test]
async fn missing_agent_id_only_skips_sweep_write() {
    let store = Arc::new(MemoryKvStore::new());
    let engine = IdentityEngine::new(store.clone(), Arc::new(AuditLog::in_memory()), enabled());

    let nameless = ResolvedSource {
        name: "armis".to_string(),
        agent_id: String::new(),
        poller_id: "p".to_string(),
        partition: "default".to_string(),
        allow_empty_snapshot: false,
    };
    let report = engine
        .process_discovery(&CancellationToken::new(), &nameless, vec![armis("10.0.0.8")], Utc::now())
        .await;
    assert!(matches!(report.sweep, Err(ConfigWriteError::MissingAgentId { .. })));
    assert_eq!(report.batch.sighting_ids.len(), 1);

    let named = ResolvedSource {
        agent_id: "agent-7".to_string(),
        ..nameless
    };
    let report = engine
        .process_discovery(&CancellationToken::new(), &named, vec![armis("10.0.0.8")], Utc::now())
        .await;
    assert!(report.sweep.is_ok());
    assert!(store.get_raw(&sweep_config_path("agent-7", "armis")).is_some());
    // Same address refreshes the same sighting.
    assert_eq!(engine.count_sightings(None), 1);
}
