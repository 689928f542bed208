use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use idr_audit::AuditSink;
use idr_identity::{normalize_ip, parse_mac_list};
use idr_promotion::{evaluate, evaluate_batch, select_policy, DriftStatus, PromotionRun};
use idr_schemas::{
    meta, DeviceUpdate, MergeAuditEvent, Metadata, Sighting, SightingEvent, SightingEventType,
    SightingStatus, SubnetPolicy,
};

use crate::{
    PromotionTarget, SightingConfig, SightingError, DEFAULT_LIST_LIMIT, DEFAULT_PARTITION,
};

/// Reason recorded on merge rows written by a promotion.
pub const MERGE_REASON_PROMOTION: &str = "sighting_promotion";
/// Reason on merge rows for a target named by an operator without identity
/// evidence.
pub const MERGE_REASON_ASSERTED: &str = "sighting_promotion_operator_asserted";

/// Owns the active sightings. Terminal sightings are handed back to the
/// caller and forgotten.
pub struct SightingManager {
    active: BTreeMap<String, Sighting>,
    /// (partition, ip) -> sighting id
    by_addr: BTreeMap<(String, String), String>,
    /// Sightings claimed by an unfinished promotion.
    promoting: BTreeSet<String>,
    config: SightingConfig,
    drift: DriftStatus,
    audit: Arc<dyn AuditSink>,
    span: tracing::Span,
}

impl SightingManager {
    pub fn new(config: SightingConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_span(config, audit, tracing::info_span!("sighting_manager"))
    }

    pub fn with_span(config: SightingConfig, audit: Arc<dyn AuditSink>, span: tracing::Span) -> Self {
        Self {
            active: BTreeMap::new(),
            by_addr: BTreeMap::new(),
            promoting: BTreeSet::new(),
            config,
            drift: DriftStatus::default(),
            audit,
            span,
        }
    }

    pub fn config(&self) -> &SightingConfig {
        &self.config
    }

    /// Drift state used by every later promotion evaluation.
    pub fn set_drift(&mut self, drift: DriftStatus) {
        self.drift = drift;
    }

    pub fn policy_for(&self, ip: &str) -> Option<&SubnetPolicy> {
        select_policy(&self.config.policies, ip)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Record an observation that matched no canonical device.
    ///
    /// The first observation of a `(partition, ip)` creates a `New`
    /// sighting; later ones refresh it to `Active`, slide its TTL and
    /// recompute its promotion. A matched sighting whose TTL already passed
    /// is expired first and the observation starts a new one.
    pub fn observe(&mut self, update: &DeviceUpdate, now: DateTime<Utc>) -> Result<&Sighting, SightingError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if update.is_retraction() {
            return Err(SightingError::Unroutable("retraction".to_string()));
        }
        let Some(ip) = normalize_ip(&update.ip) else {
            return Err(SightingError::Unroutable(format!("invalid ip {:?}", update.ip)));
        };
        let partition = match update.partition.trim() {
            "" => DEFAULT_PARTITION.to_string(),
            p => p.to_string(),
        };

        let addr = (partition.clone(), ip.clone());
        if let Some(stale) = self.by_addr.get(&addr).cloned() {
            let expired = self.active.get(&stale).is_some_and(|s| s.is_expired(now));
            if expired && !self.promoting.contains(&stale) && self.expire(&stale, now).is_some() {
                tracing::info!(sighting_id = %stale, "expired sighting re-observed; starting a new one");
            }
        }

        let policy = select_policy(&self.config.policies, &ip);
        let ttl = self.config.ttl.ttl_for(policy);

        let mut created = false;
        let id = match self.by_addr.get(&addr) {
            Some(id) => id.clone(),
            None => {
                created = true;
                let id = format!("sgt-{}", Uuid::new_v4().as_simple());
                let sighting = Sighting {
                    sighting_id: id.clone(),
                    partition,
                    ip,
                    subnet_id: policy.map(|p| p.subnet_id.clone()),
                    source: update.source.clone(),
                    status: SightingStatus::New,
                    metadata: Metadata::new(),
                    first_seen: now,
                    last_seen: now,
                    ttl_expires_at: expiry(now, ttl),
                    promotion: Default::default(),
                };
                tracing::info!(
                    sighting_id = %id,
                    partition = %sighting.partition,
                    ip = %sighting.ip,
                    source = %sighting.source,
                    "sighting created"
                );
                self.by_addr.insert(addr, id.clone());
                self.active.insert(id.clone(), sighting);
                id
            }
        };

        let Some(sighting) = self.active.get_mut(&id) else {
            return Err(SightingError::NotFound(id));
        };
        if !created {
            sighting.status = SightingStatus::Active;
        }
        sighting.last_seen = sighting.last_seen.max(now);
        sighting.ttl_expires_at = expiry(now, ttl);
        sighting.subnet_id = policy.map(|p| p.subnet_id.clone());
        merge_metadata(&mut sighting.metadata, update);
        sighting.promotion = evaluate(sighting, policy, &self.config.promotion, &self.drift, now);

        tracing::debug!(
            sighting_id = %sighting.sighting_id,
            status = sighting.status.as_str(),
            promotion = sighting.promotion.status_label(),
            blockers = sighting.promotion.blockers.len(),
            "sighting observed"
        );
        Ok(sighting)
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Claim an active sighting for promotion and return a copy of it.
    pub fn begin_promotion(&mut self, sighting_id: &str) -> Result<Sighting, SightingError> {
        let sighting = self
            .active
            .get(sighting_id)
            .cloned()
            .ok_or_else(|| SightingError::NotFound(sighting_id.to_string()))?;
        if !self.promoting.insert(sighting_id.to_string()) {
            return Err(SightingError::InFlight(sighting_id.to_string()));
        }
        Ok(sighting)
    }

    /// Release a claim without promoting. No-op when there is none.
    pub fn abandon_promotion(&mut self, sighting_id: &str) {
        self.promoting.remove(sighting_id);
    }

    pub fn is_promoting(&self, sighting_id: &str) -> bool {
        self.promoting.contains(sighting_id)
    }

    /// Promote an active sighting to `target`. Returns the final sighting.
    /// Settles any claim on it, whether or not the promotion succeeds.
    pub fn promote(
        &mut self,
        sighting_id: &str,
        actor: &str,
        target: PromotionTarget,
        now: DateTime<Utc>,
    ) -> Result<Sighting, SightingError> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.promoting.remove(sighting_id);
        let mut sighting = self.take(sighting_id)?;
        let device_id = target.device_id().to_string();

        let merge = match &target {
            PromotionTarget::Existing { confidence, .. } => Some((MERGE_REASON_PROMOTION, *confidence)),
            PromotionTarget::Asserted { .. } => Some((MERGE_REASON_ASSERTED, None)),
            PromotionTarget::New { .. } => None,
        };
        if let Some((reason, confidence)) = merge {
            let mut details = Metadata::new();
            details.insert(meta::SIGHTING_ID.to_string(), sighting.sighting_id.clone());
            details.insert("ip".to_string(), sighting.ip.clone());
            let merge = MergeAuditEvent {
                event_id: Uuid::new_v4(),
                from_device_id: format!("sighting:{}", sighting.sighting_id),
                to_device_id: device_id.clone(),
                partition: sighting.partition.clone(),
                reason: reason.to_string(),
                source: sighting.source.clone(),
                actor: actor.to_string(),
                confidence_score: confidence,
                details,
                created_at: now,
            };
            if let Err(e) = self.audit.append_merge_event(merge) {
                self.restore(sighting);
                return Err(SightingError::Audit(e.to_string()));
            }
        }

        let mut details = Metadata::new();
        details.insert("ip".to_string(), sighting.ip.clone());
        details.insert("promotion".to_string(), sighting.promotion.status_label().to_string());
        let event = self.event(&sighting, SightingEventType::Promoted, actor, Some(device_id.clone()), details, now);
        if let Err(e) = self.audit.append_sighting_event(event) {
            self.restore(sighting);
            return Err(SightingError::Audit(e.to_string()));
        }

        sighting.status = SightingStatus::Promoted;
        sighting
            .metadata
            .insert(meta::CANONICAL_DEVICE_ID.to_string(), device_id.clone());
        tracing::info!(
            sighting_id = %sighting.sighting_id,
            device_id = %device_id,
            actor,
            "sighting promoted"
        );
        Ok(sighting)
    }

    /// Remove an active sighting without promoting it. Refused while the
    /// sighting is claimed for promotion.
    pub fn dismiss(
        &mut self,
        sighting_id: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Sighting, SightingError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.promoting.contains(sighting_id) {
            return Err(SightingError::InFlight(sighting_id.to_string()));
        }
        let mut sighting = self.take(sighting_id)?;

        let mut details = Metadata::new();
        details.insert("reason".to_string(), reason.to_string());
        let event = self.event(&sighting, SightingEventType::Dismissed, actor, None, details, now);
        if let Err(e) = self.audit.append_sighting_event(event) {
            self.restore(sighting);
            return Err(SightingError::Audit(e.to_string()));
        }

        sighting.status = SightingStatus::Dismissed;
        tracing::info!(sighting_id = %sighting.sighting_id, actor, reason, "sighting dismissed");
        Ok(sighting)
    }

    /// Expire every active sighting whose TTL has passed. Sightings whose
    /// audit row cannot be written stay active and are retried next sweep;
    /// sightings claimed for promotion are left to their promoter.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<Sighting> {
        let span = self.span.clone();
        let _enter = span.enter();
        let due: Vec<String> = self
            .active
            .values()
            .filter(|s| s.is_expired(now) && !self.promoting.contains(&s.sighting_id))
            .map(|s| s.sighting_id.clone())
            .collect();

        let expired: Vec<Sighting> = due.iter().filter_map(|id| self.expire(id, now)).collect();

        if !expired.is_empty() {
            tracing::info!(expired = expired.len(), remaining = self.active.len(), "sightings expired");
        }
        expired
    }

    /// Recompute every active sighting's promotion and return the run.
    pub fn refresh_promotions(&mut self, now: DateTime<Utc>) -> PromotionRun {
        let _enter = self.span.enter();
        let snapshot: Vec<Sighting> = self.active.values().cloned().collect();
        let run = evaluate_batch(&snapshot, &self.config.policies, &self.config.promotion, &self.drift, now);
        for (id, promotion) in &run.promotions {
            if let Some(s) = self.active.get_mut(id) {
                s.promotion = promotion.clone();
            }
        }
        run
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn get(&self, sighting_id: &str) -> Option<&Sighting> {
        self.active.get(sighting_id)
    }

    /// Active sightings, newest `last_seen` first (ties by id). `limit` 0
    /// means [`DEFAULT_LIST_LIMIT`].
    pub fn list_active(&self, partition: Option<&str>, limit: usize, offset: usize) -> Vec<&Sighting> {
        let limit = if limit == 0 { DEFAULT_LIST_LIMIT } else { limit };
        let mut rows: Vec<&Sighting> = self
            .active
            .values()
            .filter(|s| partition.map_or(true, |p| s.partition == p))
            .collect();
        rows.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.sighting_id.cmp(&b.sighting_id))
        });
        rows.into_iter().skip(offset).take(limit).collect()
    }

    pub fn count_active(&self, partition: Option<&str>) -> usize {
        self.active
            .values()
            .filter(|s| partition.map_or(true, |p| s.partition == p))
            .count()
    }

    /// Active sightings whose last evaluated promotion is eligible.
    pub fn eligible(&self) -> Vec<&Sighting> {
        self.active.values().filter(|s| s.promotion.eligible).collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Move one sighting to `Expired`, writing its audit row. `None` when it
    /// is gone or the row could not be written (it then stays active).
    fn expire(&mut self, sighting_id: &str, now: DateTime<Utc>) -> Option<Sighting> {
        let mut sighting = self.take(sighting_id).ok()?;
        let mut details = Metadata::new();
        details.insert("ttl_expires_at".to_string(), sighting.ttl_expires_at.to_rfc3339());
        let event = self.event(&sighting, SightingEventType::Expired, "system", None, details, now);
        if let Err(e) = self.audit.append_sighting_event(event) {
            tracing::warn!(operation = "expire", sighting_id, error = %e, "expiry audit failed");
            self.restore(sighting);
            return None;
        }
        sighting.status = SightingStatus::Expired;
        Some(sighting)
    }

    fn take(&mut self, sighting_id: &str) -> Result<Sighting, SightingError> {
        let sighting = self
            .active
            .remove(sighting_id)
            .ok_or_else(|| SightingError::NotFound(sighting_id.to_string()))?;
        self.by_addr
            .remove(&(sighting.partition.clone(), sighting.ip.clone()));
        Ok(sighting)
    }

    fn restore(&mut self, sighting: Sighting) {
        self.by_addr.insert(
            (sighting.partition.clone(), sighting.ip.clone()),
            sighting.sighting_id.clone(),
        );
        self.active.insert(sighting.sighting_id.clone(), sighting);
    }

    fn event(
        &self,
        sighting: &Sighting,
        event_type: SightingEventType,
        actor: &str,
        device_id: Option<String>,
        details: Metadata,
        now: DateTime<Utc>,
    ) -> SightingEvent {
        SightingEvent {
            event_id: Uuid::new_v4(),
            sighting_id: sighting.sighting_id.clone(),
            partition: sighting.partition.clone(),
            device_id,
            event_type,
            actor: actor.to_string(),
            details,
            created_at: now,
        }
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fold an observation into a sighting's metadata. Non-empty values
/// overwrite; blanks never erase what was seen before.
fn merge_metadata(md: &mut Metadata, update: &DeviceUpdate) {
    for (k, v) in &update.metadata {
        if k == meta::DELETED || v.trim().is_empty() {
            continue;
        }
        md.insert(k.clone(), v.trim().to_string());
    }
    if let Some(host) = update.hostname_value() {
        md.insert(meta::HOSTNAME.to_string(), host.to_string());
    }
    if let Some(mac) = update.mac_value() {
        let macs = parse_mac_list(mac);
        if !macs.is_empty() {
            md.insert(meta::MAC.to_string(), macs.join(","));
        }
    }
}
