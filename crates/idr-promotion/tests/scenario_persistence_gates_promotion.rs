//! Scenario: a 15-minute min_persistence rule.
//! - observed 10 minutes: blocked, NextEligibleAt = first_seen + 15m
//! - observed 16 minutes with every other rule satisfied: eligible

use chrono::{DateTime, Duration, TimeZone, Utc};
use idr_promotion::{evaluate, evaluate_batch, DriftStatus, PromotionSettings};
use idr_schemas::{meta, Metadata, Promotion, PromotionRules, Sighting, SightingStatus, SubnetPolicy};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn policy() -> SubnetPolicy {
    SubnetPolicy {
        subnet_id: "lab".to_string(),
        cidr: "10.50.0.0/16".to_string(),
        classification: "lab".to_string(),
        promotion_rules: PromotionRules {
            min_persistence_secs: 15 * 60,
            require_hostname: true,
            require_fingerprint: false,
            require_agent: false,
        },
        reaper_profile: None,
        allow_ip_as_id: false,
    }
}

fn sighting(id: &str, ip: &str) -> Sighting {
    let mut metadata = Metadata::new();
    metadata.insert(meta::HOSTNAME.to_string(), "lab-host".to_string());
    Sighting {
        sighting_id: id.to_string(),
        partition: "default".to_string(),
        ip: ip.to_string(),
        subnet_id: Some("lab".to_string()),
        source: "sweep".to_string(),
        status: SightingStatus::Active,
        metadata,
        first_seen: t0(),
        last_seen: t0(),
        ttl_expires_at: t0() + Duration::hours(72),
        promotion: Promotion::default(),
    }
}

#[test]
fn ten_minutes_blocked_sixteen_minutes_eligible() {
    let s = sighting("s1", "10.50.1.1");
    let pol = policy();
    let settings = PromotionSettings::default();
    let drift = DriftStatus::default();

    let early = evaluate(&s, Some(&pol), &settings, &drift, t0() + Duration::minutes(10));
    assert!(!early.eligible);
    assert!(!early.meets_policy);
    assert_eq!(early.blockers, vec!["min_persistence not met (600s of 900s)".to_string()]);
    assert_eq!(early.satisfied, vec!["require_hostname".to_string()]);
    assert_eq!(early.next_eligible_at, Some(t0() + Duration::minutes(15)));

    let later = evaluate(&s, Some(&pol), &settings, &drift, t0() + Duration::minutes(16));
    assert!(later.eligible);
    assert!(later.meets_policy);
    assert!(later.blockers.is_empty());
    assert_eq!(
        later.satisfied,
        vec!["require_hostname".to_string(), "min_persistence".to_string()]
    );
    assert!(later.next_eligible_at.is_none());
}

#[test]
fn missing_hostname_blocker_clears_when_hostname_appears() {
    let mut s = sighting("s1", "10.50.1.1");
    s.metadata.remove(meta::HOSTNAME);
    let pol = policy();
    let now = t0() + Duration::minutes(30);

    let blocked = evaluate(&s, Some(&pol), &PromotionSettings::default(), &DriftStatus::default(), now);
    assert!(!blocked.meets_policy);
    assert_eq!(blocked.blockers, vec!["missing hostname".to_string()]);
    assert!(blocked.next_eligible_at.is_none(), "not blocked solely by persistence");

    s.metadata
        .insert(meta::HOSTNAME.to_string(), "found-later".to_string());
    let cleared = evaluate(&s, Some(&pol), &PromotionSettings::default(), &DriftStatus::default(), now);
    assert!(!cleared.blockers.iter().any(|b| b == "missing hostname"));
    assert!(cleared.meets_policy);
}

#[test]
fn batch_summary_counts_each_outcome_once() {
    let pol = policy();
    let mut no_host = sighting("s2", "10.50.2.2");
    no_host.metadata.clear();
    // Outside the lab subnet: global defaults (no rules) apply.
    let outside = sighting("s3", "192.168.9.9");
    let sightings = vec![sighting("s1", "10.50.1.1"), no_host, outside];

    let now = t0() + Duration::minutes(20);
    let run = evaluate_batch(
        &sightings,
        std::slice::from_ref(&pol),
        &PromotionSettings::default(),
        &DriftStatus::default(),
        now,
    );
    assert_eq!(run.summary.attempted, 3);
    assert_eq!(run.summary.eligible_auto, 2);
    assert_eq!(run.summary.blocked_policy, 1);
    assert_eq!(run.summary.shadow_ready, 0);
    assert!(!run.summary.shadow_only);

    let ids: Vec<&str> = run.promotions.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2", "s3"]);

    let shadow = evaluate_batch(
        &sightings,
        std::slice::from_ref(&pol),
        &PromotionSettings {
            shadow_mode: true,
            ..PromotionSettings::default()
        },
        &DriftStatus::default(),
        now,
    );
    assert_eq!(shadow.summary.eligible_auto, 0);
    assert_eq!(shadow.summary.shadow_ready, 2);
    assert!(shadow.summary.shadow_only);

    let json = serde_json::to_value(shadow.summary).unwrap();
    assert_eq!(json["shadow_ready"], 2);
}
