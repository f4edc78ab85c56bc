//! Configuration for the execution engine.
//!
//! All options are read from the environment at startup (`.env` files are
//! honored via `dotenvy` in the binary). The recognized names match the
//! operator-facing configuration surface exactly; anything else uses the
//! documented default.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::mode::ExecutionMode;

/// What the engine falls back to when policy resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicyMode {
    /// Deny every outbound request. Required in production.
    #[default]
    DenyAll,
    /// Allow everything. Test-only; selecting it logs a warning.
    Permissive,
}

impl std::str::FromStr for DefaultPolicyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "deny-all" | "denyall" => Ok(DefaultPolicyMode::DenyAll),
            "permissive" => Ok(DefaultPolicyMode::Permissive),
            _ => Err(format!(
                "invalid default policy mode '{}', expected 'deny-all' or 'permissive'",
                s
            )),
        }
    }
}

/// Resource limits applied to one execution.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum memory in bytes.
    pub memory_bytes: u64,
    /// CPU shares (relative weight, Docker convention: 1024 = one full share).
    pub cpu_share: u32,
    /// Maximum wall-clock time.
    pub wall_clock: Duration,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_share: 1024,
            wall_clock: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Execution mode selected at startup.
    pub mode: ExecutionMode,
    /// Sandbox image reference. Must be a minimal runtime-only image; the
    /// startup probe enforces this.
    pub image: String,
    /// Path of the script runtime inside the image.
    pub runtime_bin: String,
    /// Path of the script runtime on the host, for `direct` mode.
    pub host_runtime_bin: String,
    /// Whether to pull the image automatically when missing.
    pub auto_pull_image: bool,
    /// Default per-execution limits. `wall_clock` is also the hard ceiling
    /// that caller-supplied timeouts are clamped to.
    pub limits: Limits,
    /// Grace period between terminate and force-kill.
    pub kill_grace: Duration,
    /// Proxy port (0 = auto-assign an ephemeral port per execution).
    pub proxy_port: u16,
    /// Replace sensitive header values with a redaction marker in audit
    /// entries. On by default.
    pub filter_sensitive_headers: bool,
    /// Base URL of the external policy service.
    pub policy_service_url: Option<String>,
    /// TTL for cached policies.
    pub policy_cache_ttl: Duration,
    /// Gate on per-caller policy; off means the default policy is always used.
    pub enable_policy: bool,
    /// Fallback policy when resolution fails or no token is presented.
    pub default_policy_mode: DefaultPolicyMode,
    /// Ceiling on simultaneous executions.
    pub max_concurrent_executions: usize,
    /// How long a queued execution may wait for a slot.
    pub queue_deadline: Duration,
    /// Root directory for per-execution working directories.
    pub workdir_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            image: "gcr.io/distroless/nodejs24-debian12".to_string(),
            runtime_bin: "/nodejs/bin/node".to_string(),
            host_runtime_bin: "node".to_string(),
            auto_pull_image: true,
            limits: Limits::default(),
            kill_grace: Duration::from_secs(2),
            proxy_port: 0,
            filter_sensitive_headers: true,
            policy_service_url: None,
            policy_cache_ttl: Duration::from_millis(60_000),
            enable_policy: false,
            default_policy_mode: DefaultPolicyMode::DenyAll,
            max_concurrent_executions: 8,
            queue_deadline: Duration::from_secs(10),
            workdir_root: std::env::temp_dir().join("crucible"),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = read("EXECUTION_MODE") {
            config.mode = v.parse().map_err(|e| Error::Config { reason: e })?;
        }
        if let Some(v) = read("SANDBOX_IMAGE") {
            config.image = v;
        }
        if let Some(v) = read("SANDBOX_RUNTIME_BIN") {
            config.runtime_bin = v;
        }
        if let Some(v) = read("SANDBOX_MEMORY_BYTES") {
            config.limits.memory_bytes = parse_num(&v, "SANDBOX_MEMORY_BYTES")?;
        }
        if let Some(v) = read("SANDBOX_CPU_SHARE") {
            config.limits.cpu_share = parse_num(&v, "SANDBOX_CPU_SHARE")?;
        }
        if let Some(v) = read("SANDBOX_WALLCLOCK_MS") {
            config.limits.wall_clock = Duration::from_millis(parse_num(&v, "SANDBOX_WALLCLOCK_MS")?);
        }
        if let Some(v) = read("SANDBOX_MAX_OUTPUT_BYTES") {
            config.limits.max_output_bytes = parse_num(&v, "SANDBOX_MAX_OUTPUT_BYTES")?;
        }
        if let Some(v) = read("PROXY_PORT") {
            config.proxy_port = parse_num(&v, "PROXY_PORT")?;
        }
        if let Some(v) = read("FILTER_SENSITIVE_HEADERS") {
            config.filter_sensitive_headers = parse_bool(&v, "FILTER_SENSITIVE_HEADERS")?;
        }
        if let Some(v) = read("POLICY_SERVICE_URL") {
            config.policy_service_url = Some(v);
        }
        if let Some(v) = read("POLICY_CACHE_TTL_MS") {
            config.policy_cache_ttl = Duration::from_millis(parse_num(&v, "POLICY_CACHE_TTL_MS")?);
        }
        if let Some(v) = read("ENABLE_POLICY") {
            config.enable_policy = parse_bool(&v, "ENABLE_POLICY")?;
        }
        if let Some(v) = read("DEFAULT_POLICY_MODE") {
            config.default_policy_mode = v.parse().map_err(|e| Error::Config { reason: e })?;
        }
        if let Some(v) = read("MAX_CONCURRENT_EXECUTIONS") {
            config.max_concurrent_executions = parse_num(&v, "MAX_CONCURRENT_EXECUTIONS")?;
        }
        if let Some(v) = read("QUEUE_DEADLINE_MS") {
            config.queue_deadline = Duration::from_millis(parse_num(&v, "QUEUE_DEADLINE_MS")?);
        }
        if let Some(v) = read("WORKDIR_ROOT") {
            config.workdir_root = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation; also emits the permissive-mode warning.
    pub fn validate(&self) -> Result<()> {
        if self.enable_policy && self.policy_service_url.is_none() {
            return Err(Error::Config {
                reason: "ENABLE_POLICY is set but POLICY_SERVICE_URL is not".to_string(),
            });
        }
        if self.max_concurrent_executions == 0 {
            return Err(Error::Config {
                reason: "MAX_CONCURRENT_EXECUTIONS must be at least 1".to_string(),
            });
        }
        if self.limits.max_output_bytes == 0 {
            return Err(Error::Config {
                reason: "SANDBOX_MAX_OUTPUT_BYTES must be at least 1".to_string(),
            });
        }
        if self.default_policy_mode == DefaultPolicyMode::Permissive {
            tracing::warn!(
                "DEFAULT_POLICY_MODE=permissive: outbound requests without a caller \
                 policy will be allowed; do not use in production"
            );
        }
        Ok(())
    }

    /// Clamp a caller-supplied timeout to the configured hard ceiling.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) => Duration::from_millis(ms).min(self.limits.wall_clock),
            None => self.limits.wall_clock,
        }
    }
}

fn read(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::Config {
        reason: format!("{} is not a valid number: '{}'", name, value),
    })
}

fn parse_bool(value: &str, name: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config {
            reason: format!("{} is not a valid boolean: '{}'", name, value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, ExecutionMode::IsolatedProxied);
        assert_eq!(config.policy_cache_ttl, Duration::from_millis(60_000));
        assert_eq!(config.default_policy_mode, DefaultPolicyMode::DenyAll);
        assert!(config.filter_sensitive_headers);
        assert!(!config.enable_policy);
        assert_eq!(config.limits.max_output_bytes, 1024 * 1024);
    }

    #[test]
    fn test_default_policy_mode_parsing() {
        assert_eq!(
            "deny-all".parse::<DefaultPolicyMode>().unwrap(),
            DefaultPolicyMode::DenyAll
        );
        assert_eq!(
            "deny_all".parse::<DefaultPolicyMode>().unwrap(),
            DefaultPolicyMode::DenyAll
        );
        assert_eq!(
            "PERMISSIVE".parse::<DefaultPolicyMode>().unwrap(),
            DefaultPolicyMode::Permissive
        );
        assert!("open".parse::<DefaultPolicyMode>().is_err());
    }

    #[test]
    fn test_validate_rejects_policy_without_url() {
        let config = Config {
            enable_policy: true,
            policy_service_url: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let config = Config {
            max_concurrent_executions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_timeout() {
        let config = Config::default();
        let ceiling = config.limits.wall_clock;

        assert_eq!(config.clamp_timeout(None), ceiling);
        assert_eq!(config.clamp_timeout(Some(1_000)), Duration::from_secs(1));
        assert_eq!(config.clamp_timeout(Some(86_400_000)), ceiling);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true", "X").unwrap());
        assert!(parse_bool("1", "X").unwrap());
        assert!(!parse_bool("off", "X").unwrap());
        assert!(parse_bool("maybe", "X").is_err());
    }
}
