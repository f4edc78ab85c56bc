//! Crucible: a policy-enforcing sandboxed execution engine for untrusted
//! payloads.
//!
//! Executes user-supplied script payloads inside disposable, runtime-only
//! containers, forces every outbound request through an in-process egress
//! proxy that enforces per-caller policy and records a full audit log, and
//! returns one normalized result shape regardless of execution mode.
//!
//! # Components
//!
//! - [`executor`] — the sandbox runner: disposable containers (or a host
//!   process in `direct` mode), resource limits, guaranteed cleanup.
//! - [`proxy`] — the egress proxy: HTTP termination, HTTPS CONNECT
//!   tunneling, policy hooks, header redaction, per-execution audit log.
//! - [`policy`] — the policy model, pure evaluation engine, and the
//!   token-to-policy fetcher with TTL cache and deny-all fallback.
//! - [`orchestrator`] — the two-phase protocol: credentialed data fetches,
//!   sanitization, and the credential-free payload phase.
//! - [`result`] — the unified result shaper, the only exit path for
//!   execution outcomes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crucible::config::Config;
//! use crucible::executor::Engine;
//! use crucible::orchestrator::{ExecutionRequest, Orchestrator};
//! use crucible::policy::PolicyFetcher;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let default_mode = config.default_policy_mode;
//! let engine = Arc::new(Engine::new(config));
//! engine.initialize().await?;
//!
//! let fetcher = Arc::new(PolicyFetcher::disabled(default_mode));
//! let orchestrator = Orchestrator::new(engine, fetcher);
//!
//! let request: ExecutionRequest = serde_json::from_str(
//!     r#"{"payload": "console.log('hello')"}"#,
//! )?;
//! let result = orchestrator.execute(request).await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod policy;
pub mod proxy;
pub mod result;

pub use config::{Config, DefaultPolicyMode, Limits};
pub use error::{Error, ErrorKind, Result};
pub use executor::{Engine, ExecutionMode};
pub use orchestrator::{ExecutionRequest, Orchestrator};
pub use policy::{Policy, PolicyFetcher};
pub use proxy::{AuditEntry, EgressProxy, ProxyBuilder};
pub use result::{EXIT_CODE_OOM, EXIT_CODE_TIMEOUT, ExecutionResult};
