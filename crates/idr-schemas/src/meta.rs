//! Well-known metadata keys.
//!
//! Metadata maps stay `String -> String`; this module is the vocabulary the
//! engine reads and writes. Keys not listed here are opaque passthrough.

use crate::Metadata;

/// Source-local device identifier used for retraction diffing.
pub const INTEGRATION_ID: &str = "integration_id";
/// Source kind that produced `integration_id` (e.g. `netbox`).
pub const INTEGRATION_TYPE: &str = "integration_type";
pub const HOSTNAME: &str = "hostname";
pub const MAC: &str = "mac";
pub const FINGERPRINT_HASH: &str = "fingerprint_hash";
/// Set when a monitoring agent runs on the observed device itself.
pub const AGENT_ID: &str = "agent_id";

/// Tombstone marker. `"true"` means the device was retracted by its source.
pub const DELETED: &str = "_deleted";

pub const CANONICAL_DEVICE_ID: &str = "canonical_device_id";
pub const CANONICAL_PARTITION: &str = "canonical_partition";
pub const CANONICAL_METADATA_HASH: &str = "canonical_metadata_hash";
pub const CANONICAL_HOSTNAME: &str = "canonical_hostname";
pub const CANONICAL_REVISION: &str = "canonical_revision";

/// Comma-separated canonical ids that lost to the winning key.
pub const IDENTITY_CONFLICT: &str = "identity_conflict";
pub const SIGHTING_ID: &str = "sighting_id";

/// Trimmed, non-empty value for `key`.
pub fn value<'a>(md: &'a Metadata, key: &str) -> Option<&'a str> {
    md.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// `true` when `md[_deleted]` is `"true"` (case-insensitive).
pub fn is_deleted(md: &Metadata) -> bool {
    md.get(DELETED)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_ignores_blank_entries() {
        let mut md = Metadata::new();
        md.insert(HOSTNAME.to_string(), "   ".to_string());
        md.insert(MAC.to_string(), " aa:bb ".to_string());

        assert_eq!(value(&md, HOSTNAME), None);
        assert_eq!(value(&md, MAC), Some("aa:bb"));
        assert_eq!(value(&md, FINGERPRINT_HASH), None);
    }

    #[test]
    fn tombstone_detection_is_case_insensitive() {
        let mut md = Metadata::new();
        assert!(!is_deleted(&md));
        md.insert(DELETED.to_string(), "TRUE".to_string());
        assert!(is_deleted(&md));
        md.insert(DELETED.to_string(), "false".to_string());
        assert!(!is_deleted(&md));
    }
}
