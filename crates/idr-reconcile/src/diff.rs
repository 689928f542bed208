use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use idr_schemas::{meta, DeviceState, DeviceUpdate, Metadata};

/// Identity the reconciler stamps on every retraction for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceIdentity {
    pub source: String,
    pub agent_id: String,
    pub poller_id: String,
    pub partition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetractionDiff {
    /// In prior-state order.
    pub retractions: Vec<DeviceUpdate>,
    /// Device ids of prior states with no usable `integration_id`.
    pub skipped_malformed: Vec<String>,
}

/// Tombstone for a previously known device.
pub fn retraction_for(state: &DeviceState, ident: &SourceIdentity, now: DateTime<Utc>) -> DeviceUpdate {
    let mut metadata = Metadata::new();
    metadata.insert(meta::DELETED.to_string(), "true".to_string());
    DeviceUpdate {
        agent_id: ident.agent_id.clone(),
        poller_id: ident.poller_id.clone(),
        partition: ident.partition.clone(),
        source: ident.source.clone(),
        device_id: state.device_id.clone(),
        ip: state.ip.clone(),
        mac: None,
        hostname: None,
        is_available: false,
        timestamp: now,
        metadata,
    }
}

/// Retract every prior state whose `integration_id` is absent from the
/// current snapshot.
///
/// Prior states lacking an `integration_id` are skipped, never retracted.
/// Current observations without one contribute nothing to the present set.
pub fn generate_retractions(
    current: &[DeviceUpdate],
    prior: &[DeviceState],
    ident: &SourceIdentity,
    now: DateTime<Utc>,
) -> RetractionDiff {
    let present: BTreeSet<&str> = current.iter().filter_map(|u| u.integration_id()).collect();

    let mut diff = RetractionDiff::default();
    for state in prior {
        let Some(id) = state.integration_id() else {
            tracing::debug!(
                source = %ident.source,
                device_id = %state.device_id,
                "prior state has no integration_id; not retracted"
            );
            diff.skipped_malformed.push(state.device_id.clone());
            continue;
        };
        if !present.contains(id) {
            diff.retractions.push(retraction_for(state, ident, now));
        }
    }

    if !diff.skipped_malformed.is_empty() {
        tracing::warn!(
            source = %ident.source,
            operation = "generate_retractions",
            skipped = diff.skipped_malformed.len(),
            "prior states without integration_id skipped"
        );
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use idr_schemas::sources;

    fn ident() -> SourceIdentity {
        SourceIdentity {
            source: sources::ARMIS.to_string(),
            agent_id: "agent-1".to_string(),
            poller_id: "poller-1".to_string(),
            partition: "dc1".to_string(),
        }
    }

    fn state(device_id: &str, ip: &str, integration_id: Option<&str>) -> DeviceState {
        let mut metadata = Metadata::new();
        if let Some(id) = integration_id {
            metadata.insert(meta::INTEGRATION_ID.to_string(), id.to_string());
        }
        DeviceState {
            device_id: device_id.to_string(),
            ip: ip.to_string(),
            is_available: true,
            metadata,
        }
    }

    fn current(integration_id: &str) -> DeviceUpdate {
        let mut u = DeviceUpdate::observed(sources::ARMIS, "dc1", "10.1.1.1", Utc::now());
        u.metadata
            .insert(meta::INTEGRATION_ID.to_string(), integration_id.to_string());
        u
    }

    #[test]
    fn retraction_shape() {
        let now = Utc::now();
        let r = retraction_for(&state("dc1:10.0.0.1", "10.0.0.1", Some("7")), &ident(), now);
        assert_eq!(r.device_id, "dc1:10.0.0.1");
        assert_eq!(r.ip, "10.0.0.1");
        assert_eq!(r.source, "armis");
        assert_eq!(r.agent_id, "agent-1");
        assert_eq!(r.poller_id, "poller-1");
        assert_eq!(r.partition, "dc1");
        assert!(!r.is_available);
        assert_eq!(r.timestamp, now);
        assert_eq!(r.metadata.len(), 1);
        assert_eq!(r.metadata[meta::DELETED], "true");
        assert!(r.is_retraction());
    }

    #[test]
    fn blank_integration_id_is_malformed() {
        let prior = vec![state("a", "10.0.0.1", Some("  ")), state("b", "10.0.0.2", None)];
        let diff = generate_retractions(&[], &prior, &ident(), Utc::now());
        assert!(diff.retractions.is_empty());
        assert_eq!(diff.skipped_malformed, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn all_present_means_nothing_to_retract() {
        let prior = vec![state("a", "10.0.0.1", Some("1")), state("b", "10.0.0.2", Some("2"))];
        let diff = generate_retractions(&[current("2"), current("1")], &prior, &ident(), Utc::now());
        assert_eq!(diff, RetractionDiff::default());
    }
}
