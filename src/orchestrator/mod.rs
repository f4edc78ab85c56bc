//! Two-phase execution orchestration.
//!
//! Splits an execution into a credentialed phase 1 (declared data fetches,
//! run as sub-executions whose only job is one request through the egress
//! proxy) and a credential-free phase 2 (the user payload, with sanitized
//! phase-1 results exposed as read-only callable stubs).
//!
//! ```text
//! ExecutionRequest
//!   │ resolve policy (fetcher, deny-all fallback)
//!   │ start per-execution proxy (proxied modes)
//!   ▼
//! phase 1: for each declared fetch, in order
//!   resolve ${env.*} / ${var.*} → harness sub-execution → capture → sanitize
//!   ▼
//! phase 2: stub prelude + user payload, credentials stripped from env
//!   ▼
//! stop proxy → audit snapshot → unified result shape
//! ```
//!
//! Credentials exist only in phase-1 sub-execution environments, under the
//! reserved `CRUCIBLE_CREDENTIAL_` prefix. Phase-2 environments never
//! contain a key with that prefix.

pub mod fetch;
pub mod sanitize;

pub use fetch::{FetchFieldRef, FetchSpec};
pub use sanitize::Sanitizer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::executor::Engine;
use crate::policy::PolicyFetcher;
use crate::proxy::{AuditEntry, EgressProxy, ProxyBuilder};
use crate::result::{ExecutionResult, PolicyInfo};

/// Reserved prefix for caller-supplied environment overrides.
pub const ENV_OVERRIDE_PREFIX: &str = "CRUCIBLE_ENV_";

/// Reserved prefix for credential-bearing variables. Phase-2 environments
/// never contain a key with this prefix.
pub const CREDENTIAL_ENV_PREFIX: &str = "CRUCIBLE_CREDENTIAL_";

/// The caller token as seen by phase-1 fetch specs (`${env.…}`).
pub const CREDENTIAL_TOKEN_VAR: &str = "CRUCIBLE_CREDENTIAL_TOKEN";

/// Carries the resolved fetch spec into the phase-1 harness.
const FETCH_SPEC_VAR: &str = "CRUCIBLE_CREDENTIAL_FETCH_SPEC";

/// Carries sanitized phase-1 results into phase 2.
pub const PHASE1_RESULTS_VAR: &str = "CRUCIBLE_PHASE1_RESULTS";

static IDENTIFIER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static regex"));

/// An execution request, consumed exactly once.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// The user payload script.
    pub payload: String,
    /// Credentialed data fetches to run before the payload, in order.
    #[serde(default)]
    pub phase1_fetches: Vec<FetchSpec>,
    /// Caller-supplied environment overrides; keys must carry the reserved
    /// prefix.
    #[serde(default)]
    pub header_env: HashMap<String, String>,
    /// Opaque bearer credential, resolved to a policy by the fetcher.
    #[serde(default)]
    pub caller_token: Option<SecretString>,
    /// Honored by the embedder after shaping; carried through untouched.
    #[serde(default)]
    pub encrypt_response: bool,
    /// Advisory; clamped to the configured hard ceiling.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Orchestrates the two-phase protocol over the engine and policy fetcher.
pub struct Orchestrator {
    engine: Arc<Engine>,
    fetcher: Arc<PolicyFetcher>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>, fetcher: Arc<PolicyFetcher>) -> Self {
        Self { engine, fetcher }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Execute one request. Never returns an `Err`: every outcome is shaped
    /// into the single external result form.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let config = self.engine.config();
        let mode = config.mode;
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

        if let Err(e) = validate(&request) {
            return ExecutionResult::from_error(mode, &e, elapsed_ms(started), None, None);
        }

        let resolution = self.fetcher.fetch_policy(request.caller_token.as_ref()).await;
        let policy_info = PolicyInfo::from(&resolution);

        let mut limits = config.limits.clone();
        limits.wall_clock = config.clamp_timeout(request.timeout_ms);

        let proxy = if mode.uses_proxy() {
            match self.start_proxy(&resolution.policy).await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    return ExecutionResult::from_error(
                        mode,
                        &e,
                        elapsed_ms(started),
                        None,
                        Some(policy_info),
                    );
                }
            }
        } else {
            None
        };

        let proxy_port = match &proxy {
            Some(p) => p.addr().await.map(|a| a.port()),
            None => None,
        };

        // The credentialed environment visible to ${env.*} substitution.
        let mut credentialed_env = request.header_env.clone();
        if let Some(token) = &request.caller_token {
            credentialed_env.insert(
                CREDENTIAL_TOKEN_VAR.to_string(),
                token.expose_secret().to_string(),
            );
        }

        let credential_values: Vec<String> = credentialed_env
            .iter()
            .filter(|(k, _)| k.starts_with(CREDENTIAL_ENV_PREFIX))
            .map(|(_, v)| v.clone())
            .collect();
        let sanitizer = Sanitizer::new(&credential_values);

        // Phase 1: credentialed fetches, in declaration order. A failed
        // fetch becomes an error value under its name; the payload decides.
        let mut captures = serde_json::Map::new();
        for spec in &request.phase1_fetches {
            let resolved = match fetch::resolve(spec, &credentialed_env, &captures) {
                Ok(resolved) => resolved,
                Err(e) => {
                    let network_log = finish_proxy(proxy).await;
                    return ExecutionResult::from_error(
                        mode,
                        &e,
                        elapsed_ms(started),
                        network_log,
                        Some(policy_info),
                    );
                }
            };

            let value = self
                .run_phase1_fetch(&resolved, &sanitizer, spec, &limits, proxy_port)
                .await;
            captures.insert(spec.name.clone(), value);
        }

        // Phase 2: user payload with stubs, credentials absent.
        let mut phase2_env: HashMap<String, String> = request
            .header_env
            .iter()
            .filter(|(k, _)| !k.starts_with(CREDENTIAL_ENV_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let payload = if request.phase1_fetches.is_empty() {
            request.payload.clone()
        } else {
            phase2_env.insert(
                PHASE1_RESULTS_VAR.to_string(),
                serde_json::Value::Object(captures.clone()).to_string(),
            );
            build_phase2_payload(&request.payload, captures.keys())
        };

        let execution_id = Uuid::new_v4();
        let run = self
            .engine
            .run_payload(&execution_id, &payload, phase2_env, mode, &limits, proxy_port)
            .await;

        let network_log = finish_proxy(proxy).await;

        match run {
            Ok(output) => ExecutionResult::from_run(
                mode,
                output,
                elapsed_ms(started),
                network_log,
                Some(policy_info),
            ),
            Err(e) => ExecutionResult::from_error(
                mode,
                &e,
                elapsed_ms(started),
                network_log,
                Some(policy_info),
            ),
        }
    }

    async fn start_proxy(&self, policy: &Arc<crate::policy::Policy>) -> Result<EgressProxy> {
        let config = self.engine.config();

        let build = || {
            let mut builder =
                ProxyBuilder::from_config(config).with_policy(policy.clone());
            if config.mode.uses_policy() {
                builder = builder.policied();
            }
            builder.build()
        };

        let proxy = build();
        match proxy.start(config.proxy_port).await {
            Ok(_) => Ok(proxy),
            // A fixed base port can collide across concurrent executions;
            // fall back to an ephemeral one.
            Err(e) if config.proxy_port != 0 => {
                tracing::debug!(
                    port = config.proxy_port,
                    error = %e,
                    "proxy base port unavailable, using ephemeral port"
                );
                let proxy = build();
                proxy.start(0).await?;
                Ok(proxy)
            }
            Err(e) => Err(e),
        }
    }

    /// Run one phase-1 fetch as a credentialed sub-execution and return the
    /// value stored under its name.
    async fn run_phase1_fetch(
        &self,
        resolved: &fetch::ResolvedFetch,
        sanitizer: &Sanitizer,
        spec: &FetchSpec,
        limits: &crate::config::Limits,
        proxy_port: Option<u16>,
    ) -> serde_json::Value {
        let sub_id = Uuid::new_v4();
        let env = HashMap::from([(FETCH_SPEC_VAR.to_string(), resolved.to_harness_json())]);

        let run = self
            .engine
            .run_payload(
                &sub_id,
                &fetch::harness_script(FETCH_SPEC_VAR),
                env,
                self.engine.config().mode,
                limits,
                proxy_port,
            )
            .await;

        let output = match run {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(fetch = %spec.name, error = %e, "phase-1 fetch failed to run");
                return serde_json::json!({ "error": e.to_string() });
            }
        };

        if output.exit_code != 0 {
            tracing::warn!(fetch = %spec.name, exit_code = output.exit_code, "phase-1 fetch exited non-zero");
            return serde_json::json!({
                "error": format!("fetch exited with code {}", output.exit_code)
            });
        }

        match serde_json::from_str::<serde_json::Value>(output.stdout.trim()) {
            Ok(value) if value.get("error").is_some() => value,
            Ok(value) => sanitizer.sanitize_capture(value, spec.response_fields.as_deref()),
            Err(e) => {
                tracing::warn!(fetch = %spec.name, error = %e, "phase-1 fetch produced invalid output");
                serde_json::json!({ "error": "fetch produced invalid output" })
            }
        }
    }
}

async fn finish_proxy(proxy: Option<EgressProxy>) -> Option<Vec<AuditEntry>> {
    match proxy {
        Some(proxy) => {
            let log = proxy.audit_snapshot();
            proxy.stop().await;
            Some(log)
        }
        None => None,
    }
}

fn validate(request: &ExecutionRequest) -> Result<()> {
    if request.payload.trim().is_empty() {
        return Err(Error::BadRequest {
            reason: "payload is empty".to_string(),
        });
    }

    for key in request.header_env.keys() {
        if !key.starts_with(ENV_OVERRIDE_PREFIX) {
            return Err(Error::BadRequest {
                reason: format!(
                    "environment override '{}' must start with '{}'",
                    key, ENV_OVERRIDE_PREFIX
                ),
            });
        }
        if key.starts_with(CREDENTIAL_ENV_PREFIX) {
            return Err(Error::BadRequest {
                reason: format!("environment override '{}' uses a reserved prefix", key),
            });
        }
    }

    let mut seen = std::collections::HashSet::new();
    for spec in &request.phase1_fetches {
        if !IDENTIFIER.is_match(&spec.name) {
            return Err(Error::BadRequest {
                reason: format!("fetch name '{}' is not a valid identifier", spec.name),
            });
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::BadRequest {
                reason: format!("duplicate fetch name '{}'", spec.name),
            });
        }
    }

    Ok(())
}

/// Prefix the user payload with read-only stubs: `name()` returns the
/// sanitized phase-1 value (a fresh copy per call, so the payload cannot
/// mutate shared state).
fn build_phase2_payload<'a>(
    user_payload: &str,
    names: impl Iterator<Item = &'a String>,
) -> String {
    let mut script = String::new();
    script.push_str(&format!(
        "const __phase1Raw = process.env.{} ?? \"{{}}\";\n",
        PHASE1_RESULTS_VAR
    ));
    for name in names {
        let key = serde_json::to_string(name).expect("fetch name is a valid JSON string");
        script.push_str(&format!(
            "function {name}() {{ return JSON.parse(__phase1Raw)[{key}]; }}\n"
        ));
    }
    script.push('\n');
    script.push_str(user_payload);
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ExecutionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_request_deserialization() {
        let req = request(serde_json::json!({
            "payload": "console.log(1)",
            "callerToken": "tok-1",
            "timeoutMs": 5000,
            "headerEnv": {"CRUCIBLE_ENV_REGION": "us"},
            "phase1Fetches": [
                {"name": "profile", "url": "https://api.example.com/me"}
            ]
        }));

        assert_eq!(req.payload, "console.log(1)");
        assert_eq!(req.timeout_ms, Some(5000));
        assert_eq!(req.phase1_fetches.len(), 1);
        assert!(req.caller_token.is_some());
        assert!(!req.encrypt_response);
    }

    #[test]
    fn test_validate_empty_payload() {
        let req = request(serde_json::json!({"payload": "  "}));
        assert!(matches!(validate(&req), Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_validate_env_prefix() {
        let req = request(serde_json::json!({
            "payload": "1;",
            "headerEnv": {"PATH": "/evil"}
        }));
        assert!(matches!(validate(&req), Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_validate_rejects_credential_prefix_override() {
        let req = request(serde_json::json!({
            "payload": "1;",
            "headerEnv": {"CRUCIBLE_CREDENTIAL_TOKEN": "spoofed"}
        }));
        // Reserved: the credential prefix is not a legal override, even
        // though it happens to share the CRUCIBLE_ prefix family.
        assert!(matches!(validate(&req), Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_validate_fetch_names() {
        let req = request(serde_json::json!({
            "payload": "1;",
            "phase1Fetches": [{"name": "not a name", "url": "https://x.test/"}]
        }));
        assert!(matches!(validate(&req), Err(Error::BadRequest { .. })));

        let req = request(serde_json::json!({
            "payload": "1;",
            "phase1Fetches": [
                {"name": "a", "url": "https://x.test/"},
                {"name": "a", "url": "https://x.test/"}
            ]
        }));
        assert!(matches!(validate(&req), Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let req = request(serde_json::json!({
            "payload": "console.log(profile())",
            "headerEnv": {"CRUCIBLE_ENV_REGION": "us"},
            "phase1Fetches": [{"name": "profile", "url": "https://x.test/"}]
        }));
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn test_phase2_payload_prelude() {
        let names = vec!["profile".to_string(), "orders".to_string()];
        let script = build_phase2_payload("console.log(profile())", names.iter());

        assert!(script.contains("process.env.CRUCIBLE_PHASE1_RESULTS"));
        assert!(script.contains("function profile()"));
        assert!(script.contains("function orders()"));
        assert!(script.ends_with("console.log(profile())"));
        // Stubs parse fresh copies; no shared mutable object.
        assert!(script.contains("JSON.parse(__phase1Raw)"));
    }
}
