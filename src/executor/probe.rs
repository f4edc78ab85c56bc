//! Startup probe for the sandbox image invariant.
//!
//! The image must contain only the script runtime: no shell, no package
//! manager, no generic network utilities. The probe runs a short script in
//! an isolated container (no network) that checks for forbidden binaries and
//! reports what it found. A violated invariant fails the host process at
//! startup.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

use crate::config::{Config, Limits};
use crate::error::{Error, Result};
use crate::executor::container::ContainerRunner;
use crate::executor::mode::ExecutionMode;
use crate::executor::workdir::Workdir;

/// Paths that must not exist in a payload image.
const FORBIDDEN_PATHS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/dash",
    "/bin/busybox",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/apt",
    "/usr/bin/apt-get",
    "/usr/bin/dpkg",
    "/sbin/apk",
    "/usr/bin/yum",
    "/usr/bin/pip",
    "/usr/bin/curl",
    "/usr/bin/wget",
    "/usr/bin/nc",
    "/usr/bin/ssh",
];

/// Probe verdict.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ProbeReport {
    /// The runtime started and the probe script ran to completion.
    pub runtime_ok: bool,
    /// Forbidden binaries found in the image.
    pub forbidden_present: Vec<String>,
}

impl ProbeReport {
    pub fn is_clean(&self) -> bool {
        self.runtime_ok && self.forbidden_present.is_empty()
    }
}

fn probe_script() -> String {
    let paths = serde_json::to_string(FORBIDDEN_PATHS).expect("static path list");
    format!(
        r#"const fs = require("fs");
const paths = {paths};
const found = paths.filter((p) => {{
  try {{ fs.accessSync(p); return true; }} catch {{ return false; }}
}});
process.stdout.write(JSON.stringify({{ runtime_ok: true, forbidden_present: found }}));
"#
    )
}

/// Run the invariant probe against the configured image.
///
/// Returns the report; callers decide whether a dirty report is fatal (it is
/// at startup).
pub async fn probe_image(runner: &ContainerRunner, config: &Config) -> Result<ProbeReport> {
    let probe_id = Uuid::new_v4();
    let workdir = Workdir::create(&config.workdir_root, &probe_id).await?;
    workdir
        .write_file(super::container::PAYLOAD_FILE, &probe_script())
        .await?;

    let limits = Limits {
        memory_bytes: 64 * 1024 * 1024,
        cpu_share: 512,
        wall_clock: std::time::Duration::from_secs(20),
        max_output_bytes: 64 * 1024,
    };

    let result = runner
        .run_payload(
            &probe_id,
            workdir.path(),
            ExecutionMode::Isolated,
            &limits,
            HashMap::new(),
            None,
        )
        .await;

    workdir.cleanup().await;

    let output = result.map_err(|e| Error::StartFailed {
        reason: format!("image probe failed to run: {}", e),
    })?;

    if output.exit_code != 0 {
        return Ok(ProbeReport {
            runtime_ok: false,
            forbidden_present: vec![],
        });
    }

    serde_json::from_str(output.stdout.trim()).map_err(|e| Error::StartFailed {
        reason: format!("image probe produced invalid output: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_script_embeds_paths() {
        let script = probe_script();
        assert!(script.contains("/bin/sh"));
        assert!(script.contains("/usr/bin/curl"));
        assert!(script.contains("runtime_ok"));
    }

    #[test]
    fn test_report_clean() {
        let report = ProbeReport {
            runtime_ok: true,
            forbidden_present: vec![],
        };
        assert!(report.is_clean());
    }

    #[test]
    fn test_report_dirty_on_shell() {
        let report = ProbeReport {
            runtime_ok: true,
            forbidden_present: vec!["/bin/sh".to_string()],
        };
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_dirty_on_broken_runtime() {
        let report = ProbeReport {
            runtime_ok: false,
            forbidden_present: vec![],
        };
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_parses_probe_output() {
        let report: ProbeReport =
            serde_json::from_str(r#"{"runtime_ok":true,"forbidden_present":["/bin/sh"]}"#).unwrap();
        assert!(report.runtime_ok);
        assert_eq!(report.forbidden_present, vec!["/bin/sh"]);
    }
}
