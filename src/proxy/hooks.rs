//! Request and response hooks for the egress proxy.
//!
//! Hooks decide what happens to each proxied transaction: forward it
//! (optionally rewriting headers), block it with a synthetic response, or
//! mock it without contacting the upstream. Policy enforcement is itself a
//! hook ([`PolicyRequestHook`]), installed only in the policied execution
//! mode.
//!
//! A hook that fails must never take down the proxy: errors are caught by
//! the caller, logged at WARN, and treated as "no modification".

use std::sync::Arc;

use async_trait::async_trait;

use crate::policy::{self, Policy};

/// What the hooks see for one request. The policy is the snapshot captured
/// at request arrival; swaps mid-flight never affect this request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub policy: Arc<Policy>,
}

/// A fully specified response returned without contacting the upstream.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
}

/// Decision from the request hook chain.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    /// Let the request through, optionally rewriting headers.
    Forward {
        header_overrides: Vec<(String, String)>,
    },
    /// Refuse the request with a synthetic response.
    Block {
        status: u16,
        body: serde_json::Value,
        reason: String,
    },
    /// Answer from the hook without contacting the upstream.
    Mock(MockResponse),
}

impl RequestDecision {
    pub fn forward() -> Self {
        RequestDecision::Forward {
            header_overrides: vec![],
        }
    }

    /// The default denial: 403 with the standard JSON body.
    pub fn block(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        RequestDecision::Block {
            status: 403,
            body: serde_json::json!({
                "error": "request blocked",
                "reason": reason,
                "blocked_by_policy": true,
            }),
            reason,
        }
    }
}

/// Decision from the response hook chain. A hook may override status,
/// headers, or body; it may not turn a real response into an error.
#[derive(Debug, Clone)]
pub enum ResponseDecision {
    PassThrough,
    Override {
        status: Option<u16>,
        headers: Vec<(String, String)>,
        body: Option<bytes::Bytes>,
    },
}

/// Hook invoked before a request is forwarded.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, ctx: &RequestContext) -> anyhow::Result<RequestDecision>;
}

/// Hook invoked on the upstream response before it is returned.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response(
        &self,
        ctx: &RequestContext,
        status: u16,
    ) -> anyhow::Result<ResponseDecision>;
}

/// Policy-enforcing request hook. CONNECT requests get a domain-only
/// decision; everything else is evaluated against the full rule set.
pub struct PolicyRequestHook;

#[async_trait]
impl RequestHook for PolicyRequestHook {
    async fn on_request(&self, ctx: &RequestContext) -> anyhow::Result<RequestDecision> {
        let decision = if ctx.method == "CONNECT" {
            policy::decide_domain(&ctx.policy, &ctx.host)
        } else {
            policy::decide(&ctx.policy, &ctx.host, &ctx.method, &ctx.path)
        };

        if decision.allowed {
            Ok(RequestDecision::forward())
        } else {
            Ok(RequestDecision::block(decision.reason))
        }
    }
}

/// Hook that denies everything. Useful in tests and lockdown configurations.
pub struct DenyAllHook {
    reason: String,
}

impl DenyAllHook {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl RequestHook for DenyAllHook {
    async fn on_request(&self, _ctx: &RequestContext) -> anyhow::Result<RequestDecision> {
        Ok(RequestDecision::block(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::{DomainPattern, PolicySource};

    fn ctx(policy: Policy, method: &str, host: &str, path: &str) -> RequestContext {
        RequestContext {
            method: method.to_string(),
            url: format!("https://{}{}", host, path),
            host: host.to_string(),
            path: path.to_string(),
            policy: Arc::new(policy),
        }
    }

    fn allowing(domain: &str) -> Policy {
        Policy {
            allowed_domains: vec![DomainPattern::new(domain)],
            blocked_domains: vec![],
            api_path_rules: vec![],
            allowed_packages: vec![],
            allowed_binaries: vec![],
            source: PolicySource::Caller,
        }
    }

    #[tokio::test]
    async fn test_policy_hook_allows_listed_domain() {
        let hook = PolicyRequestHook;
        let decision = hook
            .on_request(&ctx(allowing("api.example.com"), "GET", "api.example.com", "/v1"))
            .await
            .unwrap();
        assert!(matches!(decision, RequestDecision::Forward { .. }));
    }

    #[tokio::test]
    async fn test_policy_hook_blocks_unlisted_domain() {
        let hook = PolicyRequestHook;
        let decision = hook
            .on_request(&ctx(Policy::deny_all(), "GET", "evil.test", "/"))
            .await
            .unwrap();
        match decision {
            RequestDecision::Block { status, body, reason } => {
                assert_eq!(status, 403);
                assert_eq!(body["blocked_by_policy"], true);
                assert!(reason.contains("domain not allowed"));
            }
            other => panic!("expected Block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_policy_hook_connect_uses_domain_only() {
        let hook = PolicyRequestHook;
        // Path rules would deny everything, but CONNECT only sees the domain.
        let mut policy = allowing("api.example.com");
        policy.api_path_rules = vec![crate::policy::model::HostRules {
            host: DomainPattern::new("api.example.com"),
            rules: vec![crate::policy::model::PathRule::new("*", "/*", false)],
        }];

        let decision = hook
            .on_request(&ctx(policy, "CONNECT", "api.example.com", "/"))
            .await
            .unwrap();
        assert!(matches!(decision, RequestDecision::Forward { .. }));
    }

    #[tokio::test]
    async fn test_deny_all_hook() {
        let hook = DenyAllHook::new("lockdown");
        let decision = hook
            .on_request(&ctx(Policy::permissive(), "GET", "api.example.com", "/"))
            .await
            .unwrap();
        assert!(matches!(decision, RequestDecision::Block { .. }));
    }

    #[test]
    fn test_default_block_shape() {
        if let RequestDecision::Block { status, body, .. } = RequestDecision::block("nope") {
            assert_eq!(status, 403);
            assert_eq!(body["reason"], "nope");
            assert_eq!(body["blocked_by_policy"], true);
            assert!(body.get("error").is_some());
        } else {
            panic!("expected Block");
        }
    }
}
