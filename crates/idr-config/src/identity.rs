use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use idr_schemas::SubnetPolicy;

use crate::LoadedConfig;

pub const DEFAULT_CHUNK_SIZE: usize = 256;
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 8;
pub const DEFAULT_PARTITION: &str = "default";
/// 72 hours.
pub const DEFAULT_TTL_SECS: u64 = 72 * 3600;
/// Reaper TTLs are capped at ten years.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

fn yes() -> bool {
    true
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent_chunks() -> usize {
    DEFAULT_MAX_CONCURRENT_CHUNKS
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TTL_SECS
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionSection {
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default)]
    pub shadow_mode: bool,
    #[serde(default)]
    pub min_persistence_secs: u64,
    #[serde(default)]
    pub require_hostname: bool,
    #[serde(default)]
    pub require_fingerprint: bool,
    #[serde(default)]
    pub require_agent: bool,
}

impl Default for PromotionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            shadow_mode: false,
            min_persistence_secs: 0,
            require_hostname: false,
            require_fingerprint: false,
            require_agent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintingSection {
    #[serde(default = "yes")]
    pub enabled: bool,
}

impl Default for FingerprintingSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperSection {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Profile name -> TTL seconds, selected by a subnet policy's
    /// `reaper_profile`.
    #[serde(default)]
    pub profiles: BTreeMap<String, u64>,
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftSection {
    /// 0 disables the guard.
    #[serde(default)]
    pub baseline_devices: u64,
    #[serde(default)]
    pub tolerance_percent: f64,
    #[serde(default)]
    pub pause_on_drift: bool,
    #[serde(default)]
    pub alert_on_drift: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSection {
    /// Off: resolver misses pass through without creating sightings.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sightings_only: bool,
    #[serde(default)]
    pub promotion: PromotionSection,
    #[serde(default)]
    pub fingerprinting: FingerprintingSection,
    #[serde(default)]
    pub reaper: ReaperSection,
    #[serde(default)]
    pub drift: DriftSection,
    #[serde(default)]
    pub subnet_policies: Vec<SubnetPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSection {
    /// Empty falls back to the default key namespace.
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
        }
    }
}

/// Node identity used when a source does not set its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefaults {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub poller_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub poller_id: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub allow_empty_snapshot: bool,
}

/// A source's effective identity after defaults were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub name: String,
    /// Empty when neither the source nor the defaults name an agent.
    pub agent_id: String,
    pub poller_id: String,
    pub partition: String,
    pub allow_empty_snapshot: bool,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub defaults: NodeDefaults,
    #[serde(default)]
    pub identity_reconciliation: ReconciliationSection,
    #[serde(default)]
    pub resolver: ResolverSection,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSection>,
}

impl IdentityConfig {
    /// Typed, normalised view of a loaded config. Unknown keys are ignored
    /// here; see [`crate::report_unused_keys`].
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let mut cfg: IdentityConfig = serde_json::from_value(loaded.config_json.clone())
            .with_context(|| format!("identity config invalid (config_hash={})", loaded.config_hash))?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_yaml_strings(yaml_docs: &[&str]) -> Result<Self> {
        Self::from_loaded(&crate::load_layered_yaml_from_strings(yaml_docs)?)
    }

    /// Apply cross-field rules. Idempotent.
    pub fn normalize(&mut self) {
        let ir = &mut self.identity_reconciliation;
        if !ir.fingerprinting.enabled {
            ir.promotion.require_fingerprint = false;
            for p in &mut ir.subnet_policies {
                p.promotion_rules.require_fingerprint = false;
            }
        }
        ir.reaper.default_ttl_secs = ir.reaper.default_ttl_secs.min(MAX_TTL_SECS);
        for ttl in ir.reaper.profiles.values_mut() {
            *ttl = (*ttl).min(MAX_TTL_SECS);
        }
        if self.resolver.chunk_size == 0 {
            self.resolver.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.resolver.max_concurrent_chunks == 0 {
            self.resolver.max_concurrent_chunks = 1;
        }
        self.resolver.namespace = self.resolver.namespace.trim().to_string();
    }

    pub fn source(&self, name: &str) -> Option<ResolvedSource> {
        let section = self.sources.get(name)?;
        Some(ResolvedSource {
            name: name.to_string(),
            agent_id: pick(section.agent_id.as_deref(), &self.defaults.agent_id),
            poller_id: pick(section.poller_id.as_deref(), &self.defaults.poller_id),
            partition: pick(section.partition.as_deref(), DEFAULT_PARTITION),
            allow_empty_snapshot: section.allow_empty_snapshot,
        })
    }

    /// Every configured source, in name order.
    pub fn resolved_sources(&self) -> Vec<ResolvedSource> {
        self.sources.keys().filter_map(|name| self.source(name)).collect()
    }
}

fn pick(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.trim().to_string(),
    }
}
