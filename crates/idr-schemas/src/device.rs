use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{meta, Metadata};

/// Discovery source names used across the engine.
pub mod sources {
    pub const ARMIS: &str = "armis";
    pub const NETBOX: &str = "netbox";
    pub const SWEEP: &str = "sweep";
    pub const SNMP: &str = "snmp";
    pub const MAPPER: &str = "mapper";
}

/// External contract unit exchanged with sources and the downstream
/// submitter. A retraction is a `DeviceUpdate` with `is_available == false`
/// and `metadata["_deleted"] == "true"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub agent_id: String,
    pub poller_id: String,
    pub partition: String,
    pub source: String,
    pub device_id: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub is_available: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// What a source connector yields. Connectors emit device updates directly.
pub type RawObservation = DeviceUpdate;

impl DeviceUpdate {
    /// Minimal available observation; callers fill the optional fields.
    pub fn observed(
        source: impl Into<String>,
        partition: impl Into<String>,
        ip: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: String::new(),
            poller_id: String::new(),
            partition: partition.into(),
            source: source.into(),
            device_id: String::new(),
            ip: ip.into(),
            mac: None,
            hostname: None,
            is_available: true,
            timestamp,
            metadata: Metadata::new(),
        }
    }

    pub fn is_retraction(&self) -> bool {
        !self.is_available && meta::is_deleted(&self.metadata)
    }

    /// Hostname from the dedicated field, falling back to metadata.
    pub fn hostname_value(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .or_else(|| meta::value(&self.metadata, meta::HOSTNAME))
    }

    /// MAC (possibly a list) from the dedicated field, falling back to metadata.
    pub fn mac_value(&self) -> Option<&str> {
        self.mac
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| meta::value(&self.metadata, meta::MAC))
    }

    pub fn integration_id(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::INTEGRATION_ID)
    }

    pub fn fingerprint_hash(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::FINGERPRINT_HASH)
    }
}

/// Last known state of a device as reported by the device-state query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub ip: String,
    pub is_available: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DeviceState {
    pub fn integration_id(&self) -> Option<&str> {
        meta::value(&self.metadata, meta::INTEGRATION_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_prefers_field_over_metadata() {
        let mut u = DeviceUpdate::observed(sources::SWEEP, "default", "10.0.0.1", Utc::now());
        u.metadata
            .insert(meta::HOSTNAME.to_string(), "from-meta".to_string());
        assert_eq!(u.hostname_value(), Some("from-meta"));

        u.hostname = Some("  ".to_string());
        assert_eq!(u.hostname_value(), Some("from-meta"));

        u.hostname = Some("from-field".to_string());
        assert_eq!(u.hostname_value(), Some("from-field"));
    }

    #[test]
    fn retraction_requires_both_flags() {
        let mut u = DeviceUpdate::observed(sources::NETBOX, "default", "10.0.0.1", Utc::now());
        u.is_available = false;
        assert!(!u.is_retraction());
        u.metadata
            .insert(meta::DELETED.to_string(), "true".to_string());
        assert!(u.is_retraction());
    }
}
