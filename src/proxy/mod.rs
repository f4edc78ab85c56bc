//! Egress proxy for sandboxed executions.
//!
//! Every outbound request from a payload passes through here. The proxy
//! decides (via hooks), records (via the audit log), and either forwards,
//! synthesizes a denial, or returns a mock.

pub mod audit;
pub mod headers;
pub mod hooks;
pub mod http;

pub use audit::{AuditEntry, AuditLog};
pub use headers::{HeaderFilter, REDACTION_MARKER, SENSITIVE_HEADER_PREFIX, is_hop_by_hop_header};
pub use hooks::{
    DenyAllHook, MockResponse, PolicyRequestHook, RequestContext, RequestDecision, RequestHook,
    ResponseDecision, ResponseHook,
};
pub use http::EgressProxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};

use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::Result;
use crate::policy::Policy;

/// Builds a configured [`EgressProxy`] for one execution.
pub struct ProxyBuilder {
    filter_sensitive_headers: bool,
    policy: Arc<Policy>,
    request_hooks: Vec<Arc<dyn RequestHook>>,
    response_hooks: Vec<Arc<dyn ResponseHook>>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            filter_sensitive_headers: true,
            policy: Arc::new(Policy::deny_all()),
            request_hooks: vec![],
            response_hooks: vec![],
        }
    }

    /// Seed builder defaults from the engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            filter_sensitive_headers: config.filter_sensitive_headers,
            ..Self::new()
        }
    }

    /// Install the policy-enforcing request hook (policied mode).
    pub fn policied(mut self) -> Self {
        self.request_hooks.push(Arc::new(PolicyRequestHook));
        self
    }

    /// Set the initial active policy.
    pub fn with_policy(mut self, policy: Arc<Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.request_hooks.push(hook);
        self
    }

    pub fn with_response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response_hooks.push(hook);
        self
    }

    pub fn filter_sensitive_headers(mut self, enabled: bool) -> Self {
        self.filter_sensitive_headers = enabled;
        self
    }

    pub fn build(self) -> EgressProxy {
        // The upstream client must ignore ambient proxy variables (it would
        // otherwise route through itself) and must not follow redirects:
        // the payload sees 3xx responses and decides.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .unwrap_or_default();

        EgressProxy::from_state(http::ProxyState {
            request_hooks: self.request_hooks,
            response_hooks: self.response_hooks,
            header_filter: HeaderFilter::new(self.filter_sensitive_headers),
            audit: Arc::new(AuditLog::new()),
            policy: RwLock::new(self.policy),
            client,
            request_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Build and start the proxy on the given port.
    pub async fn build_and_start(self, port: u16) -> Result<EgressProxy> {
        let proxy = self.build();
        proxy.start(port).await?;
        Ok(proxy)
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
