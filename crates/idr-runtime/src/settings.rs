use chrono::Duration;

use idr_config::{IdentityConfig, ResolvedSource};
use idr_identity::DEFAULT_NAMESPACE;
use idr_promotion::{DriftGuard, PromotionSettings};
use idr_reconcile::{SourceIdentity, SourceSettings};
use idr_resolver::{PublisherSettings, ResolverSettings};
use idr_schemas::PromotionRules;
use idr_sightings::{SightingConfig, TtlSettings};

/// Everything [`crate::IdentityEngine`] needs, derived from config.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Off: misses pass through unchanged and no sightings are kept.
    pub reconciliation_enabled: bool,
    pub resolver: ResolverSettings,
    pub publisher: PublisherSettings,
    pub sightings: SightingConfig,
    pub drift: DriftGuard,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&IdentityConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &IdentityConfig) -> Self {
        let ir = &cfg.identity_reconciliation;
        let namespace = if cfg.resolver.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            cfg.resolver.namespace.clone()
        };

        let promotion = PromotionSettings {
            sightings_only: ir.sightings_only,
            enabled: ir.promotion.enabled,
            shadow_mode: ir.promotion.shadow_mode,
            fingerprinting_enabled: ir.fingerprinting.enabled,
            default_rules: PromotionRules {
                min_persistence_secs: ir.promotion.min_persistence_secs,
                require_hostname: ir.promotion.require_hostname,
                require_fingerprint: ir.promotion.require_fingerprint,
                require_agent: ir.promotion.require_agent,
            },
        };

        let ttl = TtlSettings {
            default_ttl: secs(ir.reaper.default_ttl_secs),
            profiles: ir
                .reaper
                .profiles
                .iter()
                .map(|(name, s)| (name.clone(), secs(*s)))
                .collect(),
        };

        Self {
            reconciliation_enabled: ir.enabled,
            resolver: ResolverSettings {
                namespace: namespace.clone(),
                chunk_size: cfg.resolver.chunk_size,
                max_concurrent_chunks: cfg.resolver.max_concurrent_chunks,
            },
            publisher: PublisherSettings {
                namespace,
                ..PublisherSettings::default()
            },
            sightings: SightingConfig {
                policies: ir.subnet_policies.clone(),
                promotion,
                ttl,
            },
            drift: DriftGuard {
                baseline_devices: ir.drift.baseline_devices,
                tolerance_percent: ir.drift.tolerance_percent,
                pause_on_drift: ir.drift.pause_on_drift,
                alert_on_drift: ir.drift.alert_on_drift,
            },
        }
    }
}

/// Reconciler settings for one configured source.
pub fn reconciler_settings(source: &ResolvedSource) -> SourceSettings {
    SourceSettings {
        identity: SourceIdentity {
            source: source.name.clone(),
            agent_id: source.agent_id.clone(),
            poller_id: source.poller_id.clone(),
            partition: source.partition.clone(),
        },
        allow_empty_snapshot: source.allow_empty_snapshot,
    }
}

/// Seconds as a chrono duration, clamped to chrono's range.
fn secs(s: u64) -> Duration {
    Duration::seconds(s.min(i64::MAX as u64 / 1000) as i64)
}
