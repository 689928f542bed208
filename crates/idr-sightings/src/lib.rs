//! idr-sightings
//!
//! Lifecycle of observations that matched no canonical device.
//!
//! `New -> Active -> {Promoted | Dismissed | Expired}`. A sighting leaves the
//! active set exactly once, through [`SightingManager::promote`],
//! [`SightingManager::dismiss`] or [`SightingManager::sweep_expired`], and
//! each exit writes one sighting audit row. Promotion onto an existing device
//! also writes a merge row.
//!
//! A caller that must do slow work before promoting (resolving, publishing)
//! claims the sighting with [`SightingManager::begin_promotion`] first. A
//! claimed sighting cannot be dismissed, expired or claimed again until the
//! claim is settled by `promote` or released with `abandon_promotion`.
//!
//! Expiry is decided by `ttl_expires_at` alone: an expired sighting that is
//! observed again before the sweep ran is expired on the spot and the
//! observation starts a new sighting.

mod manager;

pub use manager::{SightingManager, MERGE_REASON_ASSERTED, MERGE_REASON_PROMOTION};

use std::collections::BTreeMap;
use std::fmt;

use chrono::Duration;

use idr_promotion::PromotionSettings;
use idr_schemas::SubnetPolicy;

pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_LIST_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlSettings {
    pub default_ttl: Duration,
    /// Named TTLs selected by a subnet policy's `reaper_profile`.
    pub profiles: BTreeMap<String, Duration>,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::hours(72),
            profiles: BTreeMap::new(),
        }
    }
}

impl TtlSettings {
    /// TTL for a sighting under `policy`. Unknown profiles fall back to the
    /// default.
    pub fn ttl_for(&self, policy: Option<&SubnetPolicy>) -> Duration {
        policy
            .and_then(|p| p.reaper_profile.as_deref())
            .and_then(|name| self.profiles.get(name))
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SightingConfig {
    pub policies: Vec<SubnetPolicy>,
    pub promotion: PromotionSettings,
    pub ttl: TtlSettings,
}

// ---------------------------------------------------------------------------
// Promotion target
// ---------------------------------------------------------------------------

/// Where a promoted sighting goes.
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionTarget {
    /// Attach to a canonical device that already exists. Writes a merge
    /// audit row.
    Existing {
        canonical_device_id: String,
        /// Confidence of the identity evidence that matched, if any.
        confidence: Option<f64>,
    },
    /// Attach to a canonical device named by an operator, without identity
    /// evidence. The merge row is labelled as operator-asserted.
    Asserted { canonical_device_id: String },
    /// Create a new canonical device.
    New { canonical_device_id: String },
}

impl PromotionTarget {
    pub fn device_id(&self) -> &str {
        match self {
            PromotionTarget::Existing {
                canonical_device_id,
                ..
            }
            | PromotionTarget::Asserted {
                canonical_device_id,
            }
            | PromotionTarget::New {
                canonical_device_id,
            } => canonical_device_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SightingError {
    /// No active sighting with this id (never existed or already left).
    NotFound(String),
    /// Observation cannot become a sighting (retraction, no usable IP).
    Unroutable(String),
    /// The audit row could not be written; the sighting was left in place.
    Audit(String),
    /// Another caller is promoting this sighting.
    InFlight(String),
}

impl fmt::Display for SightingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SightingError::NotFound(id) => write!(f, "no active sighting {id}"),
            SightingError::Unroutable(why) => write!(f, "observation not routable to a sighting: {why}"),
            SightingError::Audit(msg) => write!(f, "sighting audit failed: {msg}"),
            SightingError::InFlight(id) => write!(f, "sighting {id} is being promoted"),
        }
    }
}

impl std::error::Error for SightingError {}
