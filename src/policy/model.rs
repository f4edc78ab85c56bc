//! Policy data model.
//!
//! A [`Policy`] is the effective outbound-access specification for one
//! caller: allowed and blocked domain patterns plus ordered per-host
//! method/path rules. Policies are built either from the wire format of the
//! external policy service or from the process-wide defaults.

use std::fmt;

use serde::Deserialize;

/// Pattern for matching domains: exact, leading-wildcard, or match-all.
///
/// `*.example.com` matches `a.example.com` and `a.b.example.com` but not
/// `example.com` itself. The bare `*` pattern (used by the permissive
/// default policy) matches every host.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    pattern: String,
    kind: PatternKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    Exact(String),
    Wildcard(String),
    Any,
}

impl DomainPattern {
    pub fn new(pattern: &str) -> Self {
        let kind = if pattern == "*" {
            PatternKind::Any
        } else if let Some(base) = pattern.strip_prefix("*.") {
            PatternKind::Wildcard(base.to_lowercase())
        } else {
            PatternKind::Exact(pattern.to_lowercase())
        };

        Self {
            pattern: pattern.to_string(),
            kind,
        }
    }

    /// Check if a host matches this pattern. Host comparison is
    /// case-insensitive.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match &self.kind {
            PatternKind::Exact(base) => host == *base,
            // *.x matches any host that ends with ".x" but never x itself.
            PatternKind::Wildcard(base) => {
                host.len() > base.len() + 1 && host.ends_with(&format!(".{}", base))
            }
            PatternKind::Any => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        !matches!(self.kind, PatternKind::Exact(_))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Path pattern: a literal, a prefix glob (`/v1/*`), a suffix glob
/// (`*/users`), or any path (`/*`). No regex, no embedded wildcards.
/// Path matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Any,
    Exact(String),
    /// Trailing `*`: matches any path starting with the prefix.
    Prefix(String),
    /// Leading `*`: matches any path ending with the suffix.
    Suffix(String),
}

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        if pattern == "/*" || pattern == "*" {
            PathPattern::Any
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            PathPattern::Suffix(suffix.to_string())
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            PathPattern::Prefix(prefix.to_string())
        } else {
            PathPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(p) => path.starts_with(p.as_str()),
            PathPattern::Suffix(s) => path.ends_with(s.as_str()),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Any => write!(f, "/*"),
            PathPattern::Exact(p) => write!(f, "{}", p),
            PathPattern::Prefix(p) => write!(f, "{}*", p),
            PathPattern::Suffix(s) => write!(f, "*{}", s),
        }
    }
}

/// One method/path rule. Methods are upper-cased on ingest; `*` matches any.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub method: String,
    pub pattern: PathPattern,
    pub allow: bool,
}

impl PathRule {
    pub fn new(method: &str, pattern: &str, allow: bool) -> Self {
        Self {
            method: method.to_uppercase(),
            pattern: PathPattern::new(pattern),
            allow,
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.method == "*" || self.method == method) && self.pattern.matches(path)
    }
}

/// Ordered rule list for one host pattern. Declaration order is significant:
/// the first matching rule wins.
#[derive(Debug, Clone)]
pub struct HostRules {
    pub host: DomainPattern,
    pub rules: Vec<PathRule>,
}

/// Where the effective policy came from; reported in `policyInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Default,
    Caller,
}

/// The effective access policy for one caller.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allowed_domains: Vec<DomainPattern>,
    pub blocked_domains: Vec<DomainPattern>,
    pub api_path_rules: Vec<HostRules>,
    /// Advisory; enforced at the image level, carried for observability.
    pub allowed_packages: Vec<String>,
    pub allowed_binaries: Vec<String>,
    pub source: PolicySource,
}

impl Policy {
    /// The production default: deny every outbound request.
    pub fn deny_all() -> Self {
        Self {
            allowed_domains: vec![],
            blocked_domains: vec![],
            api_path_rules: vec![],
            allowed_packages: vec![],
            allowed_binaries: vec![],
            source: PolicySource::Default,
        }
    }

    /// Test-only default: allow everything. Selection is warned about at the
    /// fetcher level.
    pub fn permissive() -> Self {
        Self {
            allowed_domains: vec![DomainPattern::new("*")],
            blocked_domains: vec![],
            api_path_rules: vec![],
            allowed_packages: vec![],
            allowed_binaries: vec![],
            source: PolicySource::Default,
        }
    }

    /// Transform the policy service's wire representation into the internal
    /// shape: hosts lower-cased, methods upper-cased, rule order preserved.
    pub fn from_wire(wire: PolicyWire) -> Self {
        let mut api_path_rules = Vec::with_capacity(wire.api_path_rules.len());
        for (host, value) in wire.api_path_rules {
            match serde_json::from_value::<Vec<PathRuleWire>>(value) {
                Ok(rules) => api_path_rules.push(HostRules {
                    host: DomainPattern::new(&host),
                    rules: rules
                        .into_iter()
                        .map(|r| PathRule::new(&r.method, &r.path, r.allow))
                        .collect(),
                }),
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "dropping unparseable path rules");
                }
            }
        }

        Self {
            allowed_domains: wire
                .allowed_domains
                .iter()
                .map(|d| DomainPattern::new(d))
                .collect(),
            blocked_domains: wire
                .blocked_domains
                .iter()
                .map(|d| DomainPattern::new(d))
                .collect(),
            api_path_rules,
            allowed_packages: wire.allowed_packages,
            allowed_binaries: wire.allowed_binaries,
            source: PolicySource::Caller,
        }
    }
}

/// Wire representation returned by the policy service. Unknown fields are
/// ignored; everything except `allowedDomains` is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyWire {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Host pattern -> ordered rule list. `serde_json::Map` preserves
    /// declaration order.
    #[serde(default)]
    pub api_path_rules: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub allowed_packages: Vec<String>,
    #[serde(default)]
    pub allowed_binaries: Vec<String>,
}

/// One wire-format path rule.
#[derive(Debug, Clone, Deserialize)]
pub struct PathRuleWire {
    pub method: String,
    pub path: String,
    pub allow: bool,
}

/// Parse the host portion out of a URL string.
pub fn extract_host(url: &str) -> Option<String> {
    let rest = if let Some(stripped) = url.strip_prefix("https://") {
        stripped
    } else if let Some(stripped) = url.strip_prefix("http://") {
        stripped
    } else {
        return None;
    };

    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let host_and_port = &rest[..host_end];

    let host = if let Some(bracket_idx) = host_and_port.find('[') {
        // IPv6 literal
        let close_bracket = host_and_port.find(']')?;
        &host_and_port[bracket_idx + 1..close_bracket]
    } else if let Some(colon_idx) = host_and_port.rfind(':') {
        let after_colon = &host_and_port[colon_idx + 1..];
        if after_colon.chars().all(|c| c.is_ascii_digit()) {
            &host_and_port[..colon_idx]
        } else {
            host_and_port
        }
    } else {
        host_and_port
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Parse the path portion out of a URL string; `/` when absent.
pub fn extract_path(url: &str) -> String {
    if let Some(idx) = url.find("://") {
        let rest = &url[idx + 3..];
        if let Some(path_start) = rest.find('/') {
            let path = &rest[path_start..];
            // Path rules see the path only, never the query.
            return match path.find('?') {
                Some(q) => path[..q].to_string(),
                None => path.to_string(),
            };
        }
    }
    "/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = DomainPattern::new("api.example.com");
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("API.EXAMPLE.COM"));
        assert!(!pattern.matches("foo.api.example.com"));
        assert!(!pattern.matches("example.com"));
    }

    #[test]
    fn test_wildcard_match() {
        let pattern = DomainPattern::new("*.example.com");
        assert!(pattern.matches("api.example.com"));
        assert!(pattern.matches("foo.bar.example.com"));
        // The bare domain is not covered by its own wildcard.
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("evilexample.com"));
        assert!(!pattern.matches("other.com"));
    }

    #[test]
    fn test_any_pattern() {
        let pattern = DomainPattern::new("*");
        assert!(pattern.matches("anything.at.all"));
        assert!(pattern.is_wildcard());
    }

    #[test]
    fn test_path_pattern_parsing() {
        assert_eq!(PathPattern::new("/*"), PathPattern::Any);
        assert_eq!(
            PathPattern::new("/v1/users"),
            PathPattern::Exact("/v1/users".to_string())
        );
        assert_eq!(
            PathPattern::new("/v1/*"),
            PathPattern::Prefix("/v1/".to_string())
        );
        assert_eq!(
            PathPattern::new("*/users"),
            PathPattern::Suffix("/users".to_string())
        );
    }

    #[test]
    fn test_path_pattern_matching() {
        assert!(PathPattern::new("/*").matches("/anything"));
        assert!(PathPattern::new("/v1/*").matches("/v1/users/123"));
        assert!(!PathPattern::new("/v1/*").matches("/v2/users"));
        assert!(PathPattern::new("*/users").matches("/api/v1/users"));
        assert!(!PathPattern::new("*/users").matches("/api/v1/users/123"));
        // Case-sensitive.
        assert!(!PathPattern::new("/V1/*").matches("/v1/users"));
    }

    #[test]
    fn test_path_rule_method_normalization() {
        let rule = PathRule::new("get", "/*", true);
        assert_eq!(rule.method, "GET");
        assert!(rule.matches("GET", "/anything"));
        assert!(!rule.matches("POST", "/anything"));

        let wildcard = PathRule::new("*", "/*", false);
        assert!(wildcard.matches("DELETE", "/x"));
    }

    #[test]
    fn test_deny_all_is_empty() {
        let policy = Policy::deny_all();
        assert!(policy.allowed_domains.is_empty());
        assert_eq!(policy.source, PolicySource::Default);
    }

    #[test]
    fn test_from_wire() {
        let wire: PolicyWire = serde_json::from_value(serde_json::json!({
            "allowedDomains": ["API.Example.com", "*.okta.com"],
            "blockedDomains": ["bad.example.com"],
            "apiPathRules": {
                "*.okta.com": [
                    {"method": "get", "path": "/*", "allow": true},
                    {"method": "delete", "path": "/*", "allow": false}
                ]
            },
            "unknownField": 42
        }))
        .unwrap();

        let policy = Policy::from_wire(wire);
        assert_eq!(policy.source, PolicySource::Caller);
        assert_eq!(policy.allowed_domains.len(), 2);
        assert_eq!(policy.blocked_domains.len(), 1);
        assert_eq!(policy.api_path_rules.len(), 1);
        let rules = &policy.api_path_rules[0];
        assert_eq!(rules.rules[0].method, "GET");
        assert!(rules.rules[0].allow);
        assert_eq!(rules.rules[1].method, "DELETE");
        assert!(!rules.rules[1].allow);
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(
            extract_host("https://api.example.com/v1/endpoint"),
            Some("api.example.com".to_string())
        );
        assert_eq!(
            extract_host("http://localhost:8080/api"),
            Some("localhost".to_string())
        );
        assert_eq!(
            extract_host("https://EXAMPLE.COM"),
            Some("example.com".to_string())
        );
        assert_eq!(extract_host("not-a-url"), None);
    }

    #[test]
    fn test_extract_path() {
        assert_eq!(extract_path("https://example.com/api/v1"), "/api/v1");
        assert_eq!(extract_path("https://example.com"), "/");
        assert_eq!(extract_path("https://example.com/a?b=c"), "/a");
    }
}
