use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use idr_schemas::{Promotion, PromotionRules, Sighting, SubnetPolicy};

use crate::policy::select_policy;

pub const BLOCKER_SIGHTINGS_ONLY: &str = "promotion disabled (sightings-only mode)";
pub const BLOCKER_DISABLED: &str = "promotion disabled";
pub const BLOCKER_DRIFT: &str = "promotion paused: identity cardinality drift";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Global promotion configuration.
///
/// Precedence: `sightings_only` > `!enabled` > rule and drift blockers.
/// `shadow_mode` never adds blockers; it only withholds the side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionSettings {
    pub sightings_only: bool,
    pub enabled: bool,
    pub shadow_mode: bool,
    /// When off, `require_fingerprint` is ignored everywhere.
    pub fingerprinting_enabled: bool,
    /// Rules for sightings outside every subnet policy.
    pub default_rules: PromotionRules,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            sightings_only: false,
            enabled: true,
            shadow_mode: false,
            fingerprinting_enabled: true,
            default_rules: PromotionRules::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Drift guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftGuard {
    /// Expected device count. 0 disables the guard.
    pub baseline_devices: u64,
    pub tolerance_percent: f64,
    pub pause_on_drift: bool,
    pub alert_on_drift: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftStatus {
    pub current_devices: u64,
    pub baseline_devices: u64,
    /// Signed percentage over (positive) or under baseline.
    pub drift_percent: f64,
    pub over_tolerance: bool,
    /// Promotions are paused because of the drift.
    pub paused: bool,
}

impl DriftGuard {
    pub fn check(&self, current_devices: u64) -> DriftStatus {
        if self.baseline_devices == 0 {
            return DriftStatus {
                current_devices,
                ..DriftStatus::default()
            };
        }
        let baseline = self.baseline_devices as f64;
        let drift_percent = (current_devices as f64 - baseline) * 100.0 / baseline;
        let limit = baseline * (1.0 + self.tolerance_percent.max(0.0) / 100.0);
        let over_tolerance = current_devices as f64 > limit;

        if over_tolerance && self.alert_on_drift {
            tracing::warn!(
                current_devices,
                baseline_devices = self.baseline_devices,
                drift_percent,
                pause = self.pause_on_drift,
                "identity cardinality drift over tolerance"
            );
        }
        DriftStatus {
            current_devices,
            baseline_devices: self.baseline_devices,
            drift_percent,
            over_tolerance,
            paused: over_tolerance && self.pause_on_drift,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Decide whether `sighting` may be promoted.
///
/// Every enabled rule is evaluated; nothing short-circuits except the
/// sightings-only and disabled switches. Rule order, for both `satisfied`
/// and `blockers`: hostname, fingerprint, agent, min_persistence.
pub fn evaluate(
    sighting: &Sighting,
    policy: Option<&SubnetPolicy>,
    settings: &PromotionSettings,
    drift: &DriftStatus,
    now: DateTime<Utc>,
) -> Promotion {
    let mut p = Promotion {
        shadow_mode: settings.shadow_mode,
        ..Promotion::default()
    };

    if settings.sightings_only {
        p.blockers.push(BLOCKER_SIGHTINGS_ONLY.to_string());
        return p;
    }
    if !settings.enabled {
        p.blockers.push(BLOCKER_DISABLED.to_string());
        return p;
    }

    let rules = policy
        .map(|pol| &pol.promotion_rules)
        .unwrap_or(&settings.default_rules);

    let mut check = |name: &str, required: bool, ok: bool, blocker: String| {
        if !required {
            return;
        }
        if ok {
            p.satisfied.push(name.to_string());
        } else {
            p.blockers.push(blocker);
        }
    };

    check(
        "require_hostname",
        rules.require_hostname,
        sighting.hostname().is_some(),
        "missing hostname".to_string(),
    );
    check(
        "require_fingerprint",
        rules.require_fingerprint && settings.fingerprinting_enabled,
        sighting.fingerprint_hash().is_some(),
        "missing fingerprint".to_string(),
    );
    check(
        "require_agent",
        rules.require_agent,
        sighting.agent_id().is_some(),
        "missing agent".to_string(),
    );

    let min = rules.min_persistence();
    let observed = sighting.persistence(now);
    let persistence_met = observed >= min;
    check(
        "min_persistence",
        rules.min_persistence_secs > 0,
        persistence_met,
        format!(
            "min_persistence not met ({}s of {}s)",
            observed.num_seconds(),
            min.num_seconds()
        ),
    );

    let only_persistence_blocks = !persistence_met && p.blockers.len() == 1;
    if drift.paused {
        p.blockers.push(BLOCKER_DRIFT.to_string());
    }

    if only_persistence_blocks && !drift.paused {
        p.next_eligible_at = Some(sighting.first_seen + min);
    }

    p.meets_policy = p.blockers.is_empty();
    p.eligible = p.meets_policy && !settings.shadow_mode;
    p
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Counts from one promotion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRunSummary {
    pub attempted: usize,
    pub eligible_auto: usize,
    pub shadow_ready: usize,
    pub blocked_policy: usize,
    /// The run evaluated in shadow mode.
    pub shadow_only: bool,
    pub drift_paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromotionRun {
    /// `(sighting_id, promotion)` in input order.
    pub promotions: Vec<(String, Promotion)>,
    pub summary: PromotionRunSummary,
}

/// Evaluate every sighting against its most specific subnet policy.
pub fn evaluate_batch(
    sightings: &[Sighting],
    policies: &[SubnetPolicy],
    settings: &PromotionSettings,
    drift: &DriftStatus,
    now: DateTime<Utc>,
) -> PromotionRun {
    let mut run = PromotionRun {
        promotions: Vec::with_capacity(sightings.len()),
        summary: PromotionRunSummary {
            shadow_only: settings.shadow_mode,
            drift_paused: drift.paused,
            ..PromotionRunSummary::default()
        },
    };

    for s in sightings {
        let promotion = evaluate(s, select_policy(policies, &s.ip), settings, drift, now);
        run.summary.attempted += 1;
        if promotion.eligible {
            run.summary.eligible_auto += 1;
        } else if promotion.is_shadow_ready() {
            run.summary.shadow_ready += 1;
        } else {
            run.summary.blocked_policy += 1;
        }
        run.promotions.push((s.sighting_id.clone(), promotion));
    }

    let sum = &run.summary;
    tracing::info!(
        attempted = sum.attempted,
        eligible_auto = sum.eligible_auto,
        shadow_ready = sum.shadow_ready,
        blocked_policy = sum.blocked_policy,
        shadow_only = sum.shadow_only,
        drift_paused = sum.drift_paused,
        "promotion run evaluated"
    );
    run
}
