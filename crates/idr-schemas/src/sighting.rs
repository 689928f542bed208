use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{meta, Metadata};

// ---------------------------------------------------------------------------
// Sighting
// ---------------------------------------------------------------------------

/// Lifecycle of a sighting. `Promoted`, `Dismissed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SightingStatus {
    New,
    Active,
    Promoted,
    Dismissed,
    Expired,
}

impl SightingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SightingStatus::New => "new",
            SightingStatus::Active => "active",
            SightingStatus::Promoted => "promoted",
            SightingStatus::Dismissed => "dismissed",
            SightingStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SightingStatus::Promoted | SightingStatus::Dismissed | SightingStatus::Expired
        )
    }
}

/// Outcome of evaluating a sighting against its promotion policy.
///
/// Recomputed on every observation; never read back as a cached decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    /// Would be promoted automatically (`meets_policy && !shadow_mode`).
    pub eligible: bool,
    /// No blockers at all.
    pub meets_policy: bool,
    pub shadow_mode: bool,
    /// Rule names that passed, in evaluation order.
    pub satisfied: Vec<String>,
    /// Human-readable reasons, one per failing rule, in evaluation order.
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Promotion {
    /// Policy-ready but held back by shadow mode.
    pub fn is_shadow_ready(&self) -> bool {
        self.meets_policy && self.shadow_mode
    }

    pub fn status_label(&self) -> &'static str {
        if self.eligible {
            "eligible"
        } else if self.is_shadow_ready() {
            "policy-ready (shadow)"
        } else {
            "blocked"
        }
    }
}

/// An observation not yet matched to a canonical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    pub sighting_id: String,
    pub partition: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    pub source: String,
    pub status: SightingStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub promotion: Promotion,
}

impl Sighting {
    pub fn hostname(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::HOSTNAME)
    }

    pub fn fingerprint_hash(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::FINGERPRINT_HASH)
    }

    pub fn agent_id(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::AGENT_ID)
    }

    /// How long the sighting has been observed as of `now` (never negative).
    pub fn persistence(&self, now: DateTime<Utc>) -> Duration {
        let d = now - self.first_seen;
        if d < Duration::zero() {
            Duration::zero()
        } else {
            d
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// Subnet policy
// ---------------------------------------------------------------------------

const MAX_PERSISTENCE_SECS: u64 = 100 * 365 * 86_400;

/// Per-subnet promotion requirements. Every enabled rule is evaluated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRules {
    #[serde(default)]
    pub min_persistence_secs: u64,
    #[serde(default)]
    pub require_hostname: bool,
    #[serde(default)]
    pub require_fingerprint: bool,
    #[serde(default)]
    pub require_agent: bool,
}

impl PromotionRules {
    pub fn min_persistence(&self) -> Duration {
        // Clamped to keep chrono's millisecond range.
        Duration::seconds(self.min_persistence_secs.min(MAX_PERSISTENCE_SECS) as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetPolicy {
    pub subnet_id: String,
    pub cidr: String,
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub promotion_rules: PromotionRules,
    /// Name of the TTL profile applied to sightings in this subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaper_profile: Option<String>,
    /// Promoted devices may be identified by `<partition>:<ip>`.
    #[serde(default)]
    pub allow_ip_as_id: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_labels() {
        let mut p = Promotion::default();
        assert_eq!(p.status_label(), "blocked");

        p.meets_policy = true;
        p.shadow_mode = true;
        assert_eq!(p.status_label(), "policy-ready (shadow)");

        p.shadow_mode = false;
        p.eligible = true;
        assert_eq!(p.status_label(), "eligible");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SightingStatus::New.is_terminal());
        assert!(!SightingStatus::Active.is_terminal());
        assert!(SightingStatus::Promoted.is_terminal());
        assert!(SightingStatus::Dismissed.is_terminal());
        assert!(SightingStatus::Expired.is_terminal());
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let r: PromotionRules = serde_json::from_str(r#"{"require_hostname":true}"#).unwrap();
        assert!(r.require_hostname);
        assert_eq!(r.min_persistence_secs, 0);
        assert_eq!(r.min_persistence(), Duration::zero());
    }
}
