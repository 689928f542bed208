//! Scenario: an unknown address goes from sighting to canonical device.
//! - persistence gating holds promotion back until the window has passed
//! - auto-promotion in an IP-identity subnet creates `<partition>:<ip>`
//! - the next discovery batch resolves to the new device
//! - cardinality drift over tolerance pauses auto-promotion

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use idr_audit::{AuditLog, AuditQuery, AuditRecord, AuditSink};
use idr_config::{IdentityConfig, MAX_TTL_SECS};
use idr_kv::MemoryKvStore;
use idr_runtime::{EngineSettings, IdentityEngine, SYSTEM_ACTOR};
use idr_schemas::SightingEventType;
use idr_testkit::{init_test_tracing, ObservationBuilder};
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
identity_reconciliation:
  enabled: true
  drift:
    baseline_devices: 100
    tolerance_percent: 10
    pause_on_drift: true
  subnet_policies:
    - subnet_id: lab
      cidr: 10.50.0.0/16
      allow_ip_as_id: true
      promotion_rules:
        min_persistence_secs: 600
        require_hostname: true
"#;

fn engine() -> (IdentityEngine<MemoryKvStore>, Arc<AuditLog>) {
    init_test_tracing();
    let cfg = IdentityConfig::from_yaml_strings(&[CONFIG]).unwrap();
    let audit = Arc::new(AuditLog::in_memory());
    let engine = IdentityEngine::new(
        Arc::new(MemoryKvStore::new()),
        audit.clone(),
        EngineSettings::from_config(&cfg),
    );
    (engine, audit)
}

#[tokio::test]
async fn sighting_promotes_to_ip_identity_and_then_resolves() {
    let (engine, audit) = engine();
    let cancel = CancellationToken::new();
    let t0 = Utc::now();

    let seen = ObservationBuilder::new("sweep", "10.50.0.7")
        .hostname("lab-switch")
        .at(t0)
        .build();
    let out = engine.process_batch(&cancel, vec![seen], t0).await;
    assert_eq!(out.sighting_ids.len(), 1);
    let sighting_id = out.sighting_ids[0].clone();

    let early = engine.reconcile_sightings(&cancel, 100, t0 + Duration::minutes(5)).await;
    assert!(early.promoted.is_empty());
    assert_eq!(early.summary.blocked_policy, 1);
    let pending = engine.sighting(&sighting_id).unwrap();
    assert_eq!(
        pending.promotion.next_eligible_at,
        Some(pending.first_seen + Duration::seconds(600))
    );

    let later = t0 + Duration::minutes(11);
    let pass = engine.reconcile_sightings(&cancel, 100, later).await;
    assert!(pass.failed.is_empty(), "{:?}", pass.failed);
    assert_eq!(
        pass.promoted,
        vec![(sighting_id.clone(), "default:10.50.0.7".to_string())]
    );
    assert!(engine.sighting(&sighting_id).is_none());
    assert_eq!(engine.count_sightings(None), 0);

    let rows = audit.query(&AuditQuery {
        sighting_id: Some(sighting_id.clone()),
        ..AuditQuery::default()
    });
    assert_eq!(rows.len(), 1);
    match &rows[0] {
        AuditRecord::Sighting(e) => {
            assert_eq!(e.event_type, SightingEventType::Promoted);
            assert_eq!(e.actor, SYSTEM_ACTOR);
            assert_eq!(e.device_id.as_deref(), Some("default:10.50.0.7"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let again = ObservationBuilder::new("sweep", "10.50.0.7").at(later).build();
    let out = engine.process_batch(&cancel, vec![again], later).await;
    assert_eq!(out.resolved, 1);
    assert!(out.sighting_ids.is_empty());
    assert_eq!(out.updates[0].device_id, "default:10.50.0.7");
}

#[tokio::test]
async fn drift_over_tolerance_pauses_auto_promotion() {
    let (engine, audit) = engine();
    let cancel = CancellationToken::new();
    let t0 = Utc::now();

    let seen = ObservationBuilder::new("sweep", "10.50.0.8")
        .hostname("lab-ap")
        .at(t0)
        .build();
    engine.process_batch(&cancel, vec![seen], t0).await;

    let pass = engine
        .reconcile_sightings(&cancel, 150, t0 + Duration::hours(1))
        .await;
    assert!(pass.drift.over_tolerance);
    assert!(pass.drift.paused);
    assert!(pass.summary.drift_paused);
    assert!(pass.promoted.is_empty());
    assert_eq!(engine.count_sightings(None), 1);
    assert!(audit.is_empty());

    // Back inside tolerance the same sighting goes through.
    let pass = engine
        .reconcile_sightings(&cancel, 105, t0 + Duration::hours(1))
        .await;
    assert!(!pass.drift.paused);
    assert_eq!(pass.promoted.len(), 1);
}

#[tokio::test]
async fn operator_dismissal_is_audited() {
    let (engine, audit) = engine();
    let t0 = Utc::now();
    let out = engine
        .process_batch(
            &CancellationToken::new(),
            vec![ObservationBuilder::new("sweep", "10.50.0.9").at(t0).build()],
            t0,
        )
        .await;
    let id = out.sighting_ids[0].clone();

    let dismissed = engine
        .dismiss_sighting(&id, "ops@example", "lab decommissioned", t0)
        .unwrap();
    assert_eq!(dismissed.sighting_id, id);
    assert_eq!(engine.count_sightings(None), 0);

    let rows = audit.query(&AuditQuery {
        actor: Some("ops@example".to_string()),
        ..AuditQuery::default()
    });
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sighting_id(), Some(id.as_str()));
}

#[tokio::test]
async fn oversized_reaper_ttl_never_overflows() {
    init_test_tracing();
    let t0 = Utc::now();
    let observe = |engine: IdentityEngine<MemoryKvStore>| async move {
        let out = engine
            .process_batch(
                &CancellationToken::new(),
                vec![ObservationBuilder::new("sweep", "10.60.0.1").at(t0).build()],
                t0,
            )
            .await;
        engine.sighting(&out.sighting_ids[0]).unwrap().ttl_expires_at
    };

    // Loaded configs are capped.
    let cfg = IdentityConfig::from_yaml_strings(&[r#"
identity_reconciliation:
  enabled: true
  reaper:
    default_ttl_secs: 18446744073709551615
"#])
    .unwrap();
    let capped = IdentityEngine::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(AuditLog::in_memory()),
        EngineSettings::from_config(&cfg),
    );
    assert_eq!(
        observe(capped).await,
        t0 + Duration::seconds(MAX_TTL_SECS as i64)
    );

    // Settings built around the loader saturate at the latest instant.
    let mut raw = IdentityConfig::default();
    raw.identity_reconciliation.enabled = true;
    raw.identity_reconciliation.reaper.default_ttl_secs = u64::MAX;
    let saturated = IdentityEngine::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(AuditLog::in_memory()),
        EngineSettings::from_config(&raw),
    );
    assert_eq!(observe(saturated).await, DateTime::<Utc>::MAX_UTC);
}
