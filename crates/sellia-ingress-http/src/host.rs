//! Host-header parsing: extracts the subdomain label from an inbound
//! request's `Host` header relative to the configured base domain
//! (`spec.md` §4.7 step 1).

/// Splits `host` (already stripped of a `:port` suffix if present) into the
/// leading subdomain label and the remainder, which must equal
/// `base_domain` exactly. Returns `None` for a malformed or non-matching
/// host (caller responds 400).
pub fn extract_subdomain(host_header: &str, base_domain: &str) -> Option<String> {
    let host = host_header.split(':').next().unwrap_or(host_header);
    let base = base_domain.split(':').next().unwrap_or(base_domain);

    if host == base {
        // Host equals the base domain exactly: out-of-scope surfaces
        // (health, landing page, admin API) own this, not a tunnel.
        return None;
    }

    let suffix = format!(".{base}");
    host.strip_suffix(&suffix)
        .filter(|label| !label.is_empty())
        .map(|label| label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_leading_label() {
        assert_eq!(
            extract_subdomain("myapp.example.com", "example.com"),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn strips_port_from_both_sides() {
        assert_eq!(
            extract_subdomain("myapp.127.0.0.1.nip.io:3000", "127.0.0.1.nip.io:3000"),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn exact_base_domain_is_not_a_tunnel() {
        assert_eq!(extract_subdomain("example.com", "example.com"), None);
    }

    #[test]
    fn unrelated_host_is_rejected() {
        assert_eq!(extract_subdomain("evil.org", "example.com"), None);
    }

    #[test]
    fn empty_label_is_rejected() {
        assert_eq!(extract_subdomain(".example.com", "example.com"), None);
    }
}
