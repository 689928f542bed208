use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity keys
// ---------------------------------------------------------------------------

/// Kind of identity evidence a key carries.
///
/// `IntegrationId` is scoped by the source that issued it: `netbox` id `42`
/// and `armis` id `42` are different devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum IdentityKind {
    Ip,
    Mac,
    Hostname,
    FingerprintHash,
    IntegrationId(String),
}

impl IdentityKind {
    /// Short label for logs and audit details.
    pub fn label(&self) -> String {
        match self {
            IdentityKind::Ip => "ip".to_string(),
            IdentityKind::Mac => "mac".to_string(),
            IdentityKind::Hostname => "hostname".to_string(),
            IdentityKind::FingerprintHash => "fingerprint".to_string(),
            IdentityKind::IntegrationId(source) => format!("integration-{source}"),
        }
    }

    /// Confidence that two observations sharing a key of this kind are the
    /// same device. Recorded on merge audit rows.
    pub fn confidence(&self) -> f64 {
        match self {
            IdentityKind::FingerprintHash => 0.98,
            IdentityKind::Mac => 0.9,
            IdentityKind::Hostname => 0.75,
            IdentityKind::IntegrationId(_) => 0.7,
            IdentityKind::Ip => 0.4,
        }
    }
}

/// A `(kind, value)` pair used to look up a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub kind: IdentityKind,
    pub value: String,
}

impl IdentityKey {
    pub fn new(kind: IdentityKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.label(), self.value)
    }
}

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// The authoritative device record stored at every identity-key path that
/// resolves to it. Each stored copy carries its own KV revision; the revision
/// is not part of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub canonical_device_id: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub metadata_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Why a stored payload could not be turned into a [`CanonicalRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordCodecError {
    /// Zero-length payload.
    Empty,
    /// Payload is not a record document.
    Malformed(String),
    /// Payload decoded but carries no canonical device id.
    MissingCanonicalId,
}

impl fmt::Display for RecordCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordCodecError::Empty => write!(f, "canonical record payload is empty"),
            RecordCodecError::Malformed(msg) => {
                write!(f, "canonical record payload is malformed: {msg}")
            }
            RecordCodecError::MissingCanonicalId => {
                write!(f, "canonical record has no canonical_device_id")
            }
        }
    }
}

impl std::error::Error for RecordCodecError {}

impl CanonicalRecord {
    /// Encode as the JSON payload written to the key-value store.
    pub fn encode(&self) -> Result<Vec<u8>, RecordCodecError> {
        if self.canonical_device_id.trim().is_empty() {
            return Err(RecordCodecError::MissingCanonicalId);
        }
        serde_json::to_vec(self).map_err(|e| RecordCodecError::Malformed(e.to_string()))
    }

    /// Decode a stored payload. Only records with a non-blank canonical id
    /// are valid.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordCodecError> {
        if bytes.is_empty() {
            return Err(RecordCodecError::Empty);
        }
        let rec: CanonicalRecord = serde_json::from_slice(bytes)
            .map_err(|e| RecordCodecError::Malformed(e.to_string()))?;
        if rec.canonical_device_id.trim().is_empty() {
            return Err(RecordCodecError::MissingCanonicalId);
        }
        Ok(rec)
    }

    /// `true` when this record describes the same device state as `other`
    /// (ignores `updated_at`).
    pub fn same_identity(&self, other: &CanonicalRecord) -> bool {
        self.canonical_device_id == other.canonical_device_id
            && self.partition == other.partition
            && self.metadata_hash == other.metadata_hash
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CanonicalRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("hostname".to_string(), "core-sw-1".to_string());
        CanonicalRecord {
            canonical_device_id: "sr:core-sw-1".to_string(),
            partition: "default".to_string(),
            metadata_hash: "abc".to_string(),
            updated_at: None,
            attributes,
        }
    }

    #[test]
    fn decode_rejects_empty_and_garbage() {
        assert_eq!(CanonicalRecord::decode(b""), Err(RecordCodecError::Empty));
        assert!(matches!(
            CanonicalRecord::decode(b"{not json"),
            Err(RecordCodecError::Malformed(_))
        ));
        assert_eq!(
            CanonicalRecord::decode(br#"{"canonical_device_id":"  "}"#),
            Err(RecordCodecError::MissingCanonicalId)
        );
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let rec = CanonicalRecord::decode(br#"{"canonical_device_id":"sr:x"}"#).unwrap();
        assert_eq!(rec.canonical_device_id, "sr:x");
        assert!(rec.partition.is_empty());
        assert!(rec.attributes.is_empty());
    }

    #[test]
    fn encode_refuses_record_without_id() {
        let mut rec = record();
        rec.canonical_device_id = String::new();
        assert_eq!(rec.encode(), Err(RecordCodecError::MissingCanonicalId));
    }

    #[test]
    fn same_identity_ignores_timestamp() {
        let a = record();
        let mut b = record();
        b.updated_at = Some(Utc::now());
        assert!(a.same_identity(&b));
        b.metadata_hash = "changed".to_string();
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn integration_kind_label_carries_source() {
        let k = IdentityKey::new(IdentityKind::IntegrationId("netbox".into()), "42");
        assert_eq!(k.to_string(), "integration-netbox=42");
    }
}
