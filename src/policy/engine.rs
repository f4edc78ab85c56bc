//! Policy evaluation.
//!
//! [`decide`] is a pure function from `(policy, host, method, path)` to a
//! [`Decision`]. Evaluation order is normative:
//!
//! 1. normalize host (lowercase) and method (uppercase);
//! 2. no allowed-domain match -> deny;
//! 3. any blocked-domain match -> deny (blocks override allows);
//! 4. pick the most specific path-rule entry for the host (exact beats
//!    wildcard, first declared wins among equals; entries with empty rule
//!    lists count as absent);
//! 5. no entry -> allow;
//! 6. first matching rule in the entry wins; no match -> allow.

use crate::policy::model::{HostRules, Policy};

/// Outcome of evaluating one request against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Evaluate the domain-level portion of the policy (steps 1-3). This is all
/// that can be decided for a CONNECT tunnel, where method and path are not
/// visible without terminating TLS.
pub fn decide_domain(policy: &Policy, host: &str) -> Decision {
    let host = host.to_lowercase();

    if !policy.allowed_domains.iter().any(|p| p.matches(&host)) {
        return Decision::deny("domain not allowed");
    }

    if policy.blocked_domains.iter().any(|p| p.matches(&host)) {
        return Decision::deny("domain explicitly blocked");
    }

    Decision::allow("domain allowed")
}

/// Evaluate a full request against a policy.
pub fn decide(policy: &Policy, host: &str, method: &str, path: &str) -> Decision {
    let host = host.to_lowercase();
    let method = method.to_uppercase();

    let domain = decide_domain(policy, &host);
    if !domain.allowed {
        return domain;
    }

    let entry = match most_specific_entry(policy, &host) {
        Some(entry) => entry,
        None => return Decision::allow("domain allowed, no path rules"),
    };

    for rule in &entry.rules {
        if rule.matches(&method, path) {
            return if rule.allow {
                Decision::allow(format!(
                    "method {} {} allowed by rule for {}",
                    method, rule.pattern, entry.host
                ))
            } else {
                Decision::deny(format!(
                    "method {} denied by rule {} for {}",
                    method, rule.pattern, entry.host
                ))
            };
        }
    }

    Decision::allow("no path rule matched")
}

/// Find the most specific rule entry for a host: an exact entry beats a
/// wildcard one; among equally specific entries the first declared wins.
/// Entries with an empty rule list are treated as absent.
fn most_specific_entry<'a>(policy: &'a Policy, host: &str) -> Option<&'a HostRules> {
    let mut best: Option<&HostRules> = None;

    for entry in &policy.api_path_rules {
        if entry.rules.is_empty() || !entry.host.matches(host) {
            continue;
        }
        match best {
            None => best = Some(entry),
            Some(current) => {
                if current.host.is_wildcard() && !entry.host.is_wildcard() {
                    best = Some(entry);
                }
            }
        }
    }

    best
}
