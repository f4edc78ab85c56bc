//! Execution modes with progressively more isolation.

/// How a payload is executed.
///
/// ```text
/// ┌────────────────────────────┬──────────────────────┬──────────────────────────┐
/// │ Mode                       │ Child environment    │ Network                  │
/// ├────────────────────────────┼──────────────────────┼──────────────────────────┤
/// │ Direct                     │ Host process         │ Unrestricted             │
/// │ Isolated                   │ Disposable container │ None (loopback only)     │
/// │ IsolatedProxied            │ Disposable container │ Egress via local proxy   │
/// │ IsolatedProxiedPolicied    │ As above             │ As above + policy hooks  │
/// └────────────────────────────┴──────────────────────┴──────────────────────────┘
/// ```
///
/// The mode is selected once at startup from `EXECUTION_MODE`; per-request
/// overrides exist for administrative testing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run on the host with a minimal environment. Only for operators who
    /// explicitly trust payloads.
    Direct,

    /// Disposable container, no network interface attached.
    Isolated,

    /// Disposable container, egress forced through the local proxy.
    #[default]
    IsolatedProxied,

    /// Proxied container with per-caller policy hooks active.
    IsolatedProxiedPolicied,
}

impl ExecutionMode {
    /// Returns true if the payload runs inside a container.
    pub fn is_isolated(&self) -> bool {
        !matches!(self, ExecutionMode::Direct)
    }

    /// Returns true if outbound traffic routes through the egress proxy.
    pub fn uses_proxy(&self) -> bool {
        matches!(
            self,
            ExecutionMode::IsolatedProxied | ExecutionMode::IsolatedProxiedPolicied
        )
    }

    /// Returns true if per-caller policy hooks are active on the proxy.
    pub fn uses_policy(&self) -> bool {
        matches!(self, ExecutionMode::IsolatedProxiedPolicied)
    }

    /// Returns true if the container gets a bridged network interface.
    /// `Isolated` runs with no network at all.
    pub fn has_network(&self) -> bool {
        !matches!(self, ExecutionMode::Isolated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::Isolated => "isolated",
            ExecutionMode::IsolatedProxied => "isolated-proxied",
            ExecutionMode::IsolatedProxiedPolicied => "isolated-proxied-policied",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "direct" => Ok(ExecutionMode::Direct),
            "isolated" => Ok(ExecutionMode::Isolated),
            "isolated-proxied" | "proxied" => Ok(ExecutionMode::IsolatedProxied),
            "isolated-proxied-policied" | "policied" => Ok(ExecutionMode::IsolatedProxiedPolicied),
            _ => Err(format!(
                "invalid execution mode '{}', expected 'direct', 'isolated', \
                 'isolated-proxied', or 'isolated-proxied-policied'",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            ExecutionMode::from_str("direct").unwrap(),
            ExecutionMode::Direct
        );
        assert_eq!(
            ExecutionMode::from_str("isolated").unwrap(),
            ExecutionMode::Isolated
        );
        assert_eq!(
            ExecutionMode::from_str("isolated-proxied").unwrap(),
            ExecutionMode::IsolatedProxied
        );
        assert_eq!(
            ExecutionMode::from_str("isolated_proxied_policied").unwrap(),
            ExecutionMode::IsolatedProxiedPolicied
        );
        assert!(ExecutionMode::from_str("garbage").is_err());
    }

    #[test]
    fn test_mode_properties() {
        assert!(!ExecutionMode::Direct.is_isolated());
        assert!(ExecutionMode::Isolated.is_isolated());

        assert!(!ExecutionMode::Direct.uses_proxy());
        assert!(!ExecutionMode::Isolated.uses_proxy());
        assert!(ExecutionMode::IsolatedProxied.uses_proxy());
        assert!(ExecutionMode::IsolatedProxiedPolicied.uses_proxy());

        assert!(!ExecutionMode::IsolatedProxied.uses_policy());
        assert!(ExecutionMode::IsolatedProxiedPolicied.uses_policy());

        assert!(!ExecutionMode::Isolated.has_network());
        assert!(ExecutionMode::IsolatedProxied.has_network());
    }

    #[test]
    fn test_roundtrip() {
        for mode in [
            ExecutionMode::Direct,
            ExecutionMode::Isolated,
            ExecutionMode::IsolatedProxied,
            ExecutionMode::IsolatedProxiedPolicied,
        ] {
            assert_eq!(ExecutionMode::from_str(mode.as_str()).unwrap(), mode);
        }
    }
}
