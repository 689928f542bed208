use std::collections::BTreeSet;
use std::net::IpAddr;

use idr_schemas::{DeviceUpdate, IdentityKey, IdentityKind};

// ---------------------------------------------------------------------------
// Key builder
// ---------------------------------------------------------------------------

/// Derive the identity keys carried by one observation.
///
/// Absent or blank fields produce no key. Values are normalised per kind:
/// - ip: host address only (mask stripped), canonical textual form
/// - mac: every MAC in the field, lower-case colon form
/// - hostname: trimmed, lower-case
/// - fingerprint / integration id: trimmed, otherwise verbatim
///
/// The result is deduplicated and keeps first-insertion order; callers order
/// it with [`prioritize_keys`].
pub fn build_keys(update: &DeviceUpdate) -> Vec<IdentityKey> {
    let mut keys = Vec::new();
    let mut seen = BTreeSet::new();
    let mut add = |key: IdentityKey| {
        if key.value.is_empty() {
            return;
        }
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    };

    if let Some(ip) = normalize_ip(&update.ip) {
        add(IdentityKey::new(IdentityKind::Ip, ip));
    }

    if let Some(raw) = update.mac_value() {
        for mac in parse_mac_list(raw) {
            add(IdentityKey::new(IdentityKind::Mac, mac));
        }
    }

    if let Some(host) = update.hostname_value() {
        add(IdentityKey::new(
            IdentityKind::Hostname,
            host.to_ascii_lowercase(),
        ));
    }

    if let Some(fp) = update.fingerprint_hash() {
        add(IdentityKey::new(IdentityKind::FingerprintHash, fp));
    }

    if let Some(id) = update.integration_id() {
        let source = idr_schemas::meta::value(&update.metadata, idr_schemas::meta::INTEGRATION_TYPE)
            .unwrap_or(update.source.trim())
            .to_ascii_lowercase();
        if !source.is_empty() {
            add(IdentityKey::new(IdentityKind::IntegrationId(source), id));
        }
    }

    keys
}

/// Host address of `raw` in canonical form, or `None` when it is not an IP.
///
/// `10.0.0.5/24` -> `10.0.0.5`; `FE80::1` -> `fe80::1`.
pub fn normalize_ip(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let host = trimmed.split('/').next().unwrap_or(trimmed).trim();
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    host.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Every MAC address found in `raw`, lower-case colon form, deduplicated.
///
/// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff` and bare
/// `aabbccddeeff`, alone or in a comma/whitespace separated list. Tokens
/// that are not 12 hex digits are ignored.
pub fn parse_mac_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let hex: String = token
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let hex = hex.to_ascii_lowercase();
        let mac = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        if !out.contains(&mac) {
            out.push(mac);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Prioritizer
// ---------------------------------------------------------------------------

/// Rank of a kind in resolution order; lower wins.
///
/// FingerprintHash > Mac > Hostname > IntegrationId > Ip.
pub fn priority_rank(kind: &IdentityKind) -> u8 {
    match kind {
        IdentityKind::FingerprintHash => 0,
        IdentityKind::Mac => 1,
        IdentityKind::Hostname => 2,
        IdentityKind::IntegrationId(_) => 3,
        IdentityKind::Ip => 4,
    }
}

/// Order keys highest-confidence first. Stable: keys of the same kind keep
/// their input order. Resolution correctness depends on this order.
pub fn prioritize_keys(mut keys: Vec<IdentityKey>) -> Vec<IdentityKey> {
    keys.sort_by_key(|k| priority_rank(&k.kind));
    keys
}
