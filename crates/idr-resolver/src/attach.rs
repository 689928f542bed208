use idr_schemas::{meta, CanonicalRecord, DeviceUpdate};

use crate::resolver::IdentityConflict;

/// Attributes copied from the record when the update does not carry them.
const COPIED_ATTRIBUTES: [&str; 4] = [
    meta::INTEGRATION_ID,
    meta::INTEGRATION_TYPE,
    meta::MAC,
    meta::FINGERPRINT_HASH,
];

/// Enrich `update` with the canonical record it resolved to.
///
/// The update adopts the canonical device id. Its own non-empty values are
/// never overwritten by record attributes.
pub fn attach_canonical_metadata(update: &mut DeviceUpdate, record: &CanonicalRecord, revision: u64) {
    if update.partition.trim().is_empty() && !record.partition.is_empty() {
        update.partition = record.partition.clone();
    }
    if !record.canonical_device_id.is_empty() {
        update.device_id = record.canonical_device_id.clone();
        update.metadata.insert(
            meta::CANONICAL_DEVICE_ID.to_string(),
            record.canonical_device_id.clone(),
        );
    }
    if !record.partition.is_empty() {
        update
            .metadata
            .insert(meta::CANONICAL_PARTITION.to_string(), record.partition.clone());
    }
    if !record.metadata_hash.is_empty() {
        update.metadata.insert(
            meta::CANONICAL_METADATA_HASH.to_string(),
            record.metadata_hash.clone(),
        );
    }
    if let Some(host) = meta::value(&record.attributes, meta::HOSTNAME) {
        update
            .metadata
            .insert(meta::CANONICAL_HOSTNAME.to_string(), host.to_string());
    }

    let had_mac = update.mac_value().is_some();
    for key in COPIED_ATTRIBUTES {
        if meta::value(&update.metadata, key).is_some() {
            continue;
        }
        if let Some(v) = meta::value(&record.attributes, key) {
            update.metadata.insert(key.to_string(), v.to_string());
        }
    }
    if !had_mac {
        if let Some(mac) = meta::value(&record.attributes, meta::MAC) {
            update.mac = Some(mac.to_string());
        }
    }

    if revision != 0 {
        update
            .metadata
            .insert(meta::CANONICAL_REVISION.to_string(), revision.to_string());
    }
}

/// Tag `update` with the canonical ids its lower-priority keys pointed at.
pub fn tag_conflicts(update: &mut DeviceUpdate, conflicts: &[IdentityConflict]) {
    if conflicts.is_empty() {
        return;
    }
    let ids: Vec<&str> = conflicts.iter().map(|c| c.other_device_id.as_str()).collect();
    update
        .metadata
        .insert(meta::IDENTITY_CONFLICT.to_string(), ids.join(","));
}
