//! Direct (host-process) execution.
//!
//! Runs the payload with the host script runtime and a minimal environment.
//! No isolation beyond process boundaries; only for operators who explicitly
//! trust their payloads.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::executor::{RunOutput, TRUNCATION_MARKER};

/// Execute the payload entry file on the host.
pub async fn run_payload(
    runtime_bin: &str,
    entry_file: &Path,
    limits: &Limits,
    env: HashMap<String, String>,
) -> Result<RunOutput> {
    let start = std::time::Instant::now();

    let mut cmd = tokio::process::Command::new(runtime_bin);
    cmd.arg(entry_file)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The runtime needs PATH to resolve itself when given a bare name.
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }

    let mut child = cmd.spawn().map_err(|e| Error::StartFailed {
        reason: format!("failed to spawn {}: {}", runtime_bin, e),
    })?;

    let output = match tokio::time::timeout(limits.wall_clock, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(Error::StartFailed {
                reason: format!("payload process failed: {}", e),
            });
        }
        Err(_) => {
            // wait_with_output consumed the child; kill_on_drop delivers the
            // kill when the future above is dropped by the timeout.
            return Err(Error::Timeout(limits.wall_clock));
        }
    };

    let (stdout, stdout_truncated) = cap_output(&output.stdout, limits.max_output_bytes);
    let (stderr, stderr_truncated) = cap_output(&output.stderr, limits.max_output_bytes);

    Ok(RunOutput {
        exit_code: output.status.code().unwrap_or(-1) as i64,
        stdout,
        stderr,
        duration: start.elapsed(),
        truncated: stdout_truncated || stderr_truncated,
        oom_killed: false,
    })
}

fn cap_output(bytes: &[u8], cap: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return (text.to_string(), false);
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut capped = text[..cut].to_string();
    capped.push_str(TRUNCATION_MARKER);
    (capped, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node_available() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn write_payload(dir: &tempfile::TempDir, source: &str) -> std::path::PathBuf {
        let path = dir.path().join("main.js");
        tokio::fs::write(&path, source).await.unwrap();
        path
    }

    #[test]
    fn test_cap_output() {
        let (text, truncated) = cap_output(b"short", 100);
        assert!(!truncated);
        assert_eq!(text, "short");

        let (text, truncated) = cap_output(b"0123456789", 4);
        assert!(truncated);
        assert!(text.starts_with("0123"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_direct_execution() {
        if !node_available() {
            eprintln!("Skipping direct execution test: node not available");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let entry = write_payload(&dir, "console.log('hello'); console.error('oops');").await;

        let output = run_payload("node", &entry, &Limits::default(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
        assert!(output.stderr.contains("oops"));
        assert!(!output.truncated);
    }

    #[tokio::test]
    async fn test_direct_nonzero_exit() {
        if !node_available() {
            eprintln!("Skipping direct execution test: node not available");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let entry = write_payload(&dir, "process.exit(3);").await;

        let output = run_payload("node", &entry, &Limits::default(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_direct_timeout() {
        if !node_available() {
            eprintln!("Skipping direct execution test: node not available");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let entry = write_payload(&dir, "setTimeout(() => {}, 60000);").await;

        let limits = Limits {
            wall_clock: Duration::from_millis(200),
            ..Default::default()
        };

        let result = run_payload("node", &entry, &limits, HashMap::new()).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let entry = write_payload(&dir, "1;").await;

        let result = run_payload(
            "/nonexistent/crucible-runtime",
            &entry,
            &Limits::default(),
            HashMap::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::StartFailed { .. })));
    }
}
