use idr_schemas::{IdentityKey, IdentityKind};

/// Root prefix for canonical identity map entries.
pub const DEFAULT_NAMESPACE: &str = "device_canonical_map";

/// Storage path `<namespace>/<kind>/<sanitized-value>`.
///
/// The namespace is trimmed of `/`; an empty namespace falls back to
/// [`DEFAULT_NAMESPACE`].
pub fn key_path(key: &IdentityKey, namespace: &str) -> String {
    let ns = namespace.trim().trim_matches('/');
    let ns = if ns.is_empty() { DEFAULT_NAMESPACE } else { ns };
    format!(
        "{ns}/{}/{}",
        kind_segment(&key.kind),
        sanitize_segment(&key.value)
    )
}

pub fn kind_segment(kind: &IdentityKind) -> String {
    match kind {
        IdentityKind::Ip => "ip".to_string(),
        IdentityKind::Mac => "mac".to_string(),
        IdentityKind::Hostname => "hostname".to_string(),
        IdentityKind::FingerprintHash => "fingerprint".to_string(),
        IdentityKind::IntegrationId(source) => {
            format!(
                "integration-{}",
                sanitize_segment(&source.trim().to_ascii_lowercase())
            )
        }
    }
}

/// Escape every byte outside `[A-Za-z0-9._-]` as `=XX` (upper-case hex).
///
/// Injective, and the output never contains `/`.
pub fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("={b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_path_escapes_colons() {
        let k = IdentityKey::new(IdentityKind::Mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(
            key_path(&k, DEFAULT_NAMESPACE),
            "device_canonical_map/mac/aa=3Abb=3Acc=3Add=3Aee=3Aff"
        );
    }

    #[test]
    fn namespace_is_trimmed_and_defaulted() {
        let k = IdentityKey::new(IdentityKind::Ip, "10.0.0.1");
        assert_eq!(key_path(&k, "/custom/"), "custom/ip/10.0.0.1");
        assert_eq!(key_path(&k, "  "), "device_canonical_map/ip/10.0.0.1");
    }

    #[test]
    fn values_never_contain_slash() {
        let k = IdentityKey::new(IdentityKind::Hostname, "a/b=c");
        let p = key_path(&k, "ns");
        assert_eq!(p, "ns/hostname/a=2Fb=3Dc");
        assert_eq!(p.matches('/').count(), 2);
    }

    #[test]
    fn integration_segment_is_scoped_by_source() {
        let k = IdentityKey::new(IdentityKind::IntegrationId("NetBox".into()), "42");
        assert_eq!(key_path(&k, "ns"), "ns/integration-netbox/42");
    }

    #[test]
    fn non_ascii_is_escaped_bytewise() {
        assert_eq!(sanitize_segment("é"), "=C3=A9");
    }
}
