//! Per-caller outbound access policy: model, evaluation, and resolution.
//!
//! The [`engine`] is a pure function over the [`model`]; the [`fetcher`]
//! resolves caller tokens to policies through the external policy service
//! with a TTL cache and a deny-all fallback.

pub mod engine;
pub mod fetcher;
pub mod model;

pub use engine::{Decision, decide, decide_domain};
pub use fetcher::{
    CacheStats, HttpPolicyService, PolicyFetcher, PolicyResolution, PolicyService,
};
pub use model::{
    DomainPattern, HostRules, PathPattern, PathRule, Policy, PolicySource, PolicyWire,
    extract_host, extract_path,
};
