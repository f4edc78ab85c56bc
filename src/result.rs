//! Unified result shaping.
//!
//! Every execution mode funnels through this module; it is the only path by
//! which outcomes leave the core. Only a small set of error kinds surface as
//! `success=false` with an `error` body; everything else is observable
//! payload behavior and lands in the `data` block, with reserved exit-code
//! sentinels for timeout and out-of-memory kills.

use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::executor::{ExecutionMode, RunOutput};
use crate::policy::{PolicyResolution, PolicySource};
use crate::proxy::AuditEntry;

/// Reserved exit code reported when the payload hit the wall-clock limit.
pub const EXIT_CODE_TIMEOUT: i64 = 124;

/// Reserved exit code reported when the payload was killed by the memory
/// cap (SIGKILL from the OOM killer, Docker convention).
pub const EXIT_CODE_OOM: i64 = 137;

/// The externally visible result shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ExecutionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time_ms: u64,
    pub execution_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_log: Option<Vec<AuditEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_info: Option<PolicyInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInfo {
    pub source: PolicySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PolicyResolution> for PolicyInfo {
    fn from(resolution: &PolicyResolution) -> Self {
        Self {
            source: resolution.source,
            error: resolution.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub kind: ErrorKind,
}

impl ExecutionResult {
    /// Shape a completed payload run.
    pub fn from_run(
        mode: ExecutionMode,
        run: RunOutput,
        execution_time_ms: u64,
        network_log: Option<Vec<AuditEntry>>,
        policy_info: Option<PolicyInfo>,
    ) -> Self {
        let exit_code = if run.oom_killed {
            EXIT_CODE_OOM
        } else {
            run.exit_code
        };

        Self {
            success: exit_code == 0,
            data: Some(ExecutionData {
                stdout: run.stdout,
                stderr: run.stderr,
                exit_code,
                execution_time_ms,
                execution_mode: mode.as_str().to_string(),
                network_log,
                policy_info,
            }),
            error: None,
        }
    }

    /// Shape a failed run. Terminal kinds get an `error` body; all other
    /// kinds are reported through `data` with a sentinel exit code.
    pub fn from_error(
        mode: ExecutionMode,
        error: &Error,
        execution_time_ms: u64,
        network_log: Option<Vec<AuditEntry>>,
        policy_info: Option<PolicyInfo>,
    ) -> Self {
        let kind = error.kind();

        if kind.is_terminal() {
            return Self {
                success: false,
                data: None,
                error: Some(ErrorBody {
                    message: error.to_string(),
                    kind,
                }),
            };
        }

        let exit_code = match kind {
            ErrorKind::Timeout => EXIT_CODE_TIMEOUT,
            ErrorKind::OutOfMemory => EXIT_CODE_OOM,
            _ => -1,
        };

        Self {
            success: false,
            data: Some(ExecutionData {
                stdout: String::new(),
                stderr: error.to_string(),
                exit_code,
                execution_time_ms,
                execution_mode: mode.as_str().to_string(),
                network_log,
                policy_info,
            }),
            error: None,
        }
    }
}
