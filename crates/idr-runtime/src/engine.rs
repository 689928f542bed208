use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use idr_audit::AuditSink;
use idr_config::ResolvedSource;
use idr_identity::{build_keys, build_record, key_path, prioritize_keys};
use idr_kv::KvStore;
use idr_promotion::{DriftStatus, PromotionRunSummary};
use idr_resolver::{
    attach_canonical_metadata, tag_conflicts, CanonicalPublisher, CanonicalResolver,
    IdentityConflict, KeyWrite, PublishError, ResolveError,
};
use idr_schemas::{meta, DeviceUpdate, MergeAuditEvent, Metadata, Sighting};
use idr_sightings::{PromotionTarget, SightingError, SightingManager};

use crate::settings::EngineSettings;
use crate::sweep_config::{ConfigWriteError, SweepConfigWriter, SweepWrite};

pub const SYSTEM_ACTOR: &str = "system";
pub const MERGE_REASON_IDENTITY_CONFLICT: &str = "identity_conflict";

// ---------------------------------------------------------------------------
// Reports / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Updates to forward downstream, in input order. Misses routed to
    /// sightings are not included.
    pub updates: Vec<DeviceUpdate>,
    /// Sightings created or refreshed by this batch.
    pub sighting_ids: Vec<String>,
    pub resolved: usize,
    pub conflicts: usize,
    /// Set when resolution degraded; the batch still completed.
    pub resolve_error: Option<ResolveError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryReport {
    pub batch: BatchOutcome,
    pub sweep: Result<SweepWrite, ConfigWriteError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SightingPassReport {
    pub expired: usize,
    pub promoted: Vec<(String, String)>,
    /// `(sighting_id, error)` for auto-promotions that failed.
    pub failed: Vec<(String, String)>,
    pub summary: PromotionRunSummary,
    pub drift: DriftStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Sighting(SightingError),
    Publish(PublishError),
    /// The canonical lookup for a promotion degraded; nothing was written.
    Resolve(ResolveError),
    /// A key of the new device already belongs to another canonical device.
    KeyHeld { key: String, owner: String },
    /// Promotion requested while reconciliation is disabled.
    Disabled,
}

impl From<SightingError> for EngineError {
    fn from(e: SightingError) -> Self {
        EngineError::Sighting(e)
    }
}

impl From<PublishError> for EngineError {
    fn from(e: PublishError) -> Self {
        EngineError::Publish(e)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Sighting(e) => write!(f, "{e}"),
            EngineError::Publish(e) => write!(f, "canonical publish failed: {e}"),
            EngineError::Resolve(e) => write!(f, "promotion lookup failed: {e}"),
            EngineError::KeyHeld { key, owner } => {
                write!(f, "identity key {key} already belongs to {owner}")
            }
            EngineError::Disabled => write!(f, "identity reconciliation is disabled"),
        }
    }
}

impl std::error::Error for EngineError {}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One identity engine per process. Resolution state is per call; only the
/// active sightings live across calls.
pub struct IdentityEngine<S> {
    resolver: CanonicalResolver<Arc<S>>,
    publisher: CanonicalPublisher<Arc<S>>,
    sweep: SweepConfigWriter<Arc<S>>,
    sightings: Mutex<SightingManager>,
    audit: Arc<dyn AuditSink>,
    settings: EngineSettings,
    span: tracing::Span,
}

impl<S: KvStore + 'static> IdentityEngine<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>, settings: EngineSettings) -> Self {
        Self::with_span(store, audit, settings, tracing::info_span!("identity_engine"))
    }

    pub fn with_span(
        store: Arc<S>,
        audit: Arc<dyn AuditSink>,
        settings: EngineSettings,
        span: tracing::Span,
    ) -> Self {
        Self {
            resolver: CanonicalResolver::with_span(
                store.clone(),
                settings.resolver.clone(),
                tracing::info_span!(parent: &span, "canonical_resolver"),
            ),
            publisher: CanonicalPublisher::with_span(
                store.clone(),
                settings.publisher.clone(),
                tracing::info_span!(parent: &span, "canonical_publisher"),
            ),
            sweep: SweepConfigWriter::new(store),
            sightings: Mutex::new(SightingManager::with_span(
                settings.sightings.clone(),
                audit.clone(),
                tracing::info_span!(parent: &span, "sighting_manager"),
            )),
            audit,
            settings,
            span,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn manager(&self) -> MutexGuard<'_, SightingManager> {
        self.sightings.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Resolve a discovery batch against the canonical map.
    ///
    /// Hits are enriched with canonical metadata. Misses become sightings
    /// when reconciliation is enabled and otherwise pass through unchanged.
    /// Retractions and updates without keys pass through untouched.
    pub async fn process_batch(
        &self,
        cancel: &CancellationToken,
        updates: Vec<DeviceUpdate>,
        now: DateTime<Utc>,
    ) -> BatchOutcome {
        self.process_batch_inner(cancel, updates, now)
            .instrument(self.span.clone())
            .await
    }

    async fn process_batch_inner(
        &self,
        cancel: &CancellationToken,
        updates: Vec<DeviceUpdate>,
        now: DateTime<Utc>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        // Only resolvable updates take part in the lookup.
        let mut slots: Vec<usize> = Vec::new();
        let mut device_keys = Vec::new();
        for (i, u) in updates.iter().enumerate() {
            if u.is_retraction() {
                continue;
            }
            let keys = prioritize_keys(build_keys(u));
            if keys.is_empty() {
                continue;
            }
            slots.push(i);
            device_keys.push(keys);
        }

        let resolved = self.resolver.resolve(cancel, &device_keys).await;
        outcome.resolve_error = resolved.first_error.clone();

        let mut lookup: Vec<Option<idr_resolver::DeviceResolution>> = vec![None; updates.len()];
        for (slot, resolution) in slots.into_iter().zip(resolved.devices) {
            lookup[slot] = Some(resolution);
        }

        let mut audited: BTreeSet<(String, String)> = BTreeSet::new();
        for (mut update, resolution) in updates.into_iter().zip(lookup) {
            let Some(resolution) = resolution else {
                outcome.updates.push(update);
                continue;
            };

            if let Some(hit) = &resolution.hit {
                attach_canonical_metadata(&mut update, &hit.record, hit.revision);
                tag_conflicts(&mut update, &resolution.conflicts);
                for c in &resolution.conflicts {
                    if audited.insert((c.other_device_id.clone(), c.winner_device_id.clone())) {
                        self.audit_conflict(&update, c, now);
                    }
                }
                outcome.resolved += 1;
                outcome.conflicts += resolution.conflicts.len();
                outcome.updates.push(update);
                continue;
            }

            if !self.settings.reconciliation_enabled {
                outcome.updates.push(update);
                continue;
            }

            match self.manager().observe(&update, now) {
                Ok(s) => outcome.sighting_ids.push(s.sighting_id.clone()),
                Err(e) => {
                    tracing::debug!(
                        source = %update.source,
                        operation = "observe_sighting",
                        error = %e,
                        "miss not routed to sightings"
                    );
                    outcome.updates.push(update);
                }
            }
        }

        tracing::info!(
            forwarded = outcome.updates.len(),
            resolved = outcome.resolved,
            sightings = outcome.sighting_ids.len(),
            conflicts = outcome.conflicts,
            degraded = outcome.resolve_error.is_some(),
            "discovery batch processed"
        );
        outcome
    }

    /// [`Self::process_batch`], then write the source's derived sweep
    /// config. A failed config write is logged and reported, never fatal.
    pub async fn process_discovery(
        &self,
        cancel: &CancellationToken,
        source: &ResolvedSource,
        updates: Vec<DeviceUpdate>,
        now: DateTime<Utc>,
    ) -> DiscoveryReport {
        let sweep = self.sweep.write(&source.agent_id, &source.name, &updates).await;
        if let Err(e) = &sweep {
            self.span.in_scope(|| {
                tracing::warn!(
                    source = %source.name,
                    operation = "write_sweep_config",
                    devices = updates.len(),
                    error = %e,
                    "sweep config write skipped"
                );
            });
        }
        let batch = self.process_batch(cancel, updates, now).await;
        DiscoveryReport { batch, sweep }
    }

    fn audit_conflict(&self, update: &DeviceUpdate, c: &IdentityConflict, now: DateTime<Utc>) {
        let mut details = Metadata::new();
        details.insert("winner_key".to_string(), c.winner_key.to_string());
        details.insert("other_key".to_string(), c.other_key.to_string());
        details.insert("ip".to_string(), update.ip.clone());
        let event = MergeAuditEvent {
            event_id: Uuid::new_v4(),
            from_device_id: c.other_device_id.clone(),
            to_device_id: c.winner_device_id.clone(),
            partition: update.partition.clone(),
            reason: MERGE_REASON_IDENTITY_CONFLICT.to_string(),
            source: update.source.clone(),
            actor: SYSTEM_ACTOR.to_string(),
            confidence_score: Some(c.winner_key.kind.confidence()),
            details,
            created_at: now,
        };
        if let Err(e) = self.audit.append_merge_event(event) {
            tracing::warn!(
                source = %update.source,
                operation = "audit_conflict",
                error = %e,
                "identity conflict not audited"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Sighting review
    // -----------------------------------------------------------------------

    /// Promote a sighting.
    ///
    /// With `target` set, the sighting attaches to that canonical device as
    /// an operator assertion. Otherwise its keys are resolved first: a hit attaches to the existing
    /// device, a miss creates a new one (`<partition>:<ip>` when its subnet
    /// allows IP identity, else `sr:<uuid>`) and publishes its record.
    pub async fn promote_sighting(
        &self,
        cancel: &CancellationToken,
        sighting_id: &str,
        actor: &str,
        target: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Sighting, EngineError> {
        self.promote_inner(cancel, sighting_id, actor, target, now)
            .instrument(self.span.clone())
            .await
    }

    async fn promote_inner(
        &self,
        cancel: &CancellationToken,
        sighting_id: &str,
        actor: &str,
        target: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Sighting, EngineError> {
        if !self.settings.reconciliation_enabled {
            return Err(EngineError::Disabled);
        }
        let (sighting, allow_ip_as_id) = {
            let mut mgr = self.manager();
            let s = mgr.begin_promotion(sighting_id)?;
            let allow = mgr.policy_for(&s.ip).is_some_and(|p| p.allow_ip_as_id);
            (s, allow)
        };
        let mut claim = PromotionClaim {
            sightings: &self.sightings,
            sighting_id,
            settled: false,
        };

        let target = match target {
            Some(id) => PromotionTarget::Asserted {
                canonical_device_id: id,
            },
            None => self.choose_target(cancel, &sighting, allow_ip_as_id, now).await?,
        };

        let promoted = self.manager().promote(sighting_id, actor, target, now);
        claim.settled = true;
        Ok(promoted?)
    }

    async fn choose_target(
        &self,
        cancel: &CancellationToken,
        sighting: &Sighting,
        allow_ip_as_id: bool,
        now: DateTime<Utc>,
    ) -> Result<PromotionTarget, EngineError> {
        let mut update = sighting_update(sighting, now);
        let keys = prioritize_keys(build_keys(&update));
        let resolved = self.resolver.resolve(cancel, std::slice::from_ref(&keys)).await;
        if let Some(err) = resolved.first_error {
            tracing::warn!(
                sighting_id = %sighting.sighting_id,
                operation = "promote_sighting",
                keys = keys.len(),
                error = %err,
                "promotion deferred: canonical lookup degraded"
            );
            return Err(EngineError::Resolve(err));
        }
        if let Some(hit) = resolved.devices.into_iter().next().and_then(|d| d.hit) {
            return Ok(PromotionTarget::Existing {
                canonical_device_id: hit.record.canonical_device_id,
                confidence: Some(hit.key.kind.confidence()),
            });
        }

        let device_id = if allow_ip_as_id {
            format!("{}:{}", sighting.partition, sighting.ip)
        } else {
            format!("sr:{}", Uuid::new_v4())
        };
        update.device_id = device_id.clone();

        let record = build_record(&update, now);
        for key in &keys {
            let path = key_path(key, &self.settings.publisher.namespace);
            if let KeyWrite::Held { owner } = self.publisher.upsert(cancel, &path, &record).await? {
                return Err(EngineError::KeyHeld { key: path, owner });
            }
        }
        tracing::info!(
            sighting_id = %sighting.sighting_id,
            device_id = %device_id,
            keys = keys.len(),
            "canonical device created from sighting"
        );
        Ok(PromotionTarget::New {
            canonical_device_id: device_id,
        })
    }

    pub fn dismiss_sighting(
        &self,
        sighting_id: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Sighting, EngineError> {
        Ok(self.manager().dismiss(sighting_id, actor, reason, now)?)
    }

    /// Periodic sighting maintenance: expire, check drift against
    /// `known_devices`, re-evaluate, then auto-promote what is eligible.
    pub async fn reconcile_sightings(
        &self,
        cancel: &CancellationToken,
        known_devices: u64,
        now: DateTime<Utc>,
    ) -> SightingPassReport {
        let mut report = SightingPassReport {
            drift: self.settings.drift.check(known_devices),
            ..SightingPassReport::default()
        };

        let eligible: Vec<String> = {
            let mut mgr = self.manager();
            report.expired = mgr.sweep_expired(now).len();
            mgr.set_drift(report.drift);
            let run = mgr.refresh_promotions(now);
            report.summary = run.summary;
            run.promotions
                .into_iter()
                .filter(|(_, p)| p.eligible)
                .map(|(id, _)| id)
                .collect()
        };

        if self.settings.reconciliation_enabled {
            for id in eligible {
                if cancel.is_cancelled() {
                    break;
                }
                match self.promote_sighting(cancel, &id, SYSTEM_ACTOR, None, now).await {
                    Ok(s) => {
                        let device = meta::value(&s.metadata, meta::CANONICAL_DEVICE_ID)
                            .map(str::to_string)
                            .unwrap_or_default();
                        report.promoted.push((id, device));
                    }
                    Err(e) => report.failed.push((id, e.to_string())),
                }
            }
        }

        self.span.in_scope(|| {
            tracing::info!(
                expired = report.expired,
                promoted = report.promoted.len(),
                failed = report.failed.len(),
                drift_paused = report.drift.paused,
                "sighting reconcile pass complete"
            );
        });
        report
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn sighting(&self, sighting_id: &str) -> Option<Sighting> {
        self.manager().get(sighting_id).cloned()
    }

    pub fn list_sightings(&self, partition: Option<&str>, limit: usize, offset: usize) -> Vec<Sighting> {
        self.manager()
            .list_active(partition, limit, offset)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn count_sightings(&self, partition: Option<&str>) -> usize {
        self.manager().count_active(partition)
    }
}

/// Releases a sighting's promotion claim unless the promotion settled it,
/// including when the promoting future is dropped mid-flight.
struct PromotionClaim<'a> {
    sightings: &'a Mutex<SightingManager>,
    sighting_id: &'a str,
    settled: bool,
}

impl Drop for PromotionClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.sightings
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .abandon_promotion(self.sighting_id);
        }
    }
}

/// The update a sighting stands for, used to build its keys and record.
fn sighting_update(s: &Sighting, now: DateTime<Utc>) -> DeviceUpdate {
    let mut u = DeviceUpdate::observed(s.source.clone(), s.partition.clone(), s.ip.clone(), now);
    u.hostname = s.hostname().map(str::to_string);
    u.mac = meta::value(&s.metadata, meta::MAC).map(str::to_string);
    u.metadata = s.metadata.clone();
    u
}
