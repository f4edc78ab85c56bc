//! Header handling: sensitive-value redaction for audit copies and the
//! hop-by-hop strip list for forwarding.

use std::collections::BTreeMap;

/// Marker substituted for sensitive header values in audit entries.
pub const REDACTION_MARKER: &str = "[redacted]";

/// Reserved header prefix; anything under it is treated as sensitive.
pub const SENSITIVE_HEADER_PREFIX: &str = "x-crucible-";

const SENSITIVE_NAMES: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

/// Redacts sensitive header values in audit copies. The request actually
/// sent upstream is never modified.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    enabled: bool,
}

impl HeaderFilter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether a header name counts as sensitive.
    pub fn is_sensitive(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        SENSITIVE_NAMES.contains(&name.as_str()) || name.starts_with(SENSITIVE_HEADER_PREFIX)
    }

    /// Produce the audit copy of a header map, redacting sensitive values
    /// when filtering is enabled.
    pub fn audit_copy<'a>(
        &self,
        headers: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> BTreeMap<String, String> {
        headers
            .map(|(name, value)| {
                let name = name.to_lowercase();
                let value = if self.enabled && self.is_sensitive(&name) {
                    REDACTION_MARKER.to_string()
                } else {
                    value.to_string()
                };
                (name, value)
            })
            .collect()
    }
}

impl Default for HeaderFilter {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Check if a header is hop-by-hop (must not be forwarded upstream).
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_names() {
        let filter = HeaderFilter::default();
        assert!(filter.is_sensitive("authorization"));
        assert!(filter.is_sensitive("Authorization"));
        assert!(filter.is_sensitive("cookie"));
        assert!(filter.is_sensitive("set-cookie"));
        assert!(filter.is_sensitive("proxy-authorization"));
        assert!(filter.is_sensitive("x-crucible-token"));
        assert!(filter.is_sensitive("X-Crucible-Anything"));

        assert!(!filter.is_sensitive("content-type"));
        assert!(!filter.is_sensitive("accept"));
    }

    #[test]
    fn test_audit_copy_redacts() {
        let filter = HeaderFilter::new(true);
        let headers = vec![
            ("Authorization", "Bearer sk-secret"),
            ("Content-Type", "application/json"),
        ];
        let copy = filter.audit_copy(headers.into_iter());

        assert_eq!(copy["authorization"], REDACTION_MARKER);
        assert_eq!(copy["content-type"], "application/json");
    }

    #[test]
    fn test_audit_copy_disabled_keeps_values() {
        let filter = HeaderFilter::new(false);
        let headers = vec![("Authorization", "Bearer sk-secret")];
        let copy = filter.audit_copy(headers.into_iter());
        assert_eq!(copy["authorization"], "Bearer sk-secret");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }
}
