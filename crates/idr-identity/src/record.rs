use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use idr_schemas::{meta, CanonicalRecord, DeviceUpdate, IdentityKey, Metadata};

use crate::keys::{build_keys, normalize_ip, parse_mac_list};

/// Record attribute holding the source that first produced the device.
const ATTR_SOURCE: &str = "source";
const ATTR_IP: &str = "ip";

/// SHA-256 (hex) over the identity-relevant fields of `update`.
///
/// Only device id, ip, partition, mac, hostname, fingerprint and integration
/// id/type participate. Any other metadata is noise and leaves the hash
/// unchanged.
pub fn hash_identity_metadata(update: &DeviceUpdate) -> String {
    let ip = normalize_ip(&update.ip).unwrap_or_else(|| update.ip.trim().to_string());
    let macs = update
        .mac_value()
        .map(|m| parse_mac_list(m).join(","))
        .unwrap_or_default();
    let fields: [(&str, String); 8] = [
        ("device_id", update.device_id.trim().to_string()),
        ("ip", ip),
        ("partition", update.partition.trim().to_string()),
        ("mac", macs),
        (
            "hostname",
            update
                .hostname_value()
                .map(str::to_ascii_lowercase)
                .unwrap_or_default(),
        ),
        (
            "fingerprint_hash",
            update.fingerprint_hash().unwrap_or_default().to_string(),
        ),
        (
            "integration_id",
            update.integration_id().unwrap_or_default().to_string(),
        ),
        (
            "integration_type",
            meta::value(&update.metadata, meta::INTEGRATION_TYPE)
                .unwrap_or_default()
                .to_string(),
        ),
    ];

    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Canonical record describing `update`, keyed by its `device_id`.
///
/// Attributes carry exactly the identity fields needed to rebuild the keys
/// with [`keys_from_record`].
pub fn build_record(update: &DeviceUpdate, now: DateTime<Utc>) -> CanonicalRecord {
    let mut attributes = Metadata::new();
    let mut put = |k: &str, v: Option<String>| {
        if let Some(v) = v.filter(|v| !v.is_empty()) {
            attributes.insert(k.to_string(), v);
        }
    };

    put(ATTR_IP, normalize_ip(&update.ip));
    put(
        meta::MAC,
        update.mac_value().map(|m| parse_mac_list(m).join(",")),
    );
    put(meta::HOSTNAME, update.hostname_value().map(str::to_string));
    put(
        meta::FINGERPRINT_HASH,
        update.fingerprint_hash().map(str::to_string),
    );
    put(
        meta::INTEGRATION_ID,
        update.integration_id().map(str::to_string),
    );
    put(
        meta::INTEGRATION_TYPE,
        meta::value(&update.metadata, meta::INTEGRATION_TYPE).map(str::to_string),
    );
    put(ATTR_SOURCE, Some(update.source.trim().to_string()));

    CanonicalRecord {
        canonical_device_id: update.device_id.trim().to_string(),
        partition: update.partition.trim().to_string(),
        metadata_hash: hash_identity_metadata(update),
        updated_at: Some(now),
        attributes,
    }
}

/// Identity keys a stored record answers to, rebuilt from its attributes.
pub fn keys_from_record(record: &CanonicalRecord) -> Vec<IdentityKey> {
    let attr = |k: &str| meta::value(&record.attributes, k).map(str::to_string);

    let mut update = DeviceUpdate::observed(
        attr(ATTR_SOURCE).unwrap_or_default(),
        record.partition.clone(),
        attr(ATTR_IP).unwrap_or_default(),
        record.updated_at.unwrap_or_else(Utc::now),
    );
    update.device_id = record.canonical_device_id.clone();
    update.mac = attr(meta::MAC);
    update.hostname = attr(meta::HOSTNAME);
    for k in [
        meta::FINGERPRINT_HASH,
        meta::INTEGRATION_ID,
        meta::INTEGRATION_TYPE,
    ] {
        if let Some(v) = attr(k) {
            update.metadata.insert(k.to_string(), v);
        }
    }
    build_keys(&update)
}
