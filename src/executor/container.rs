//! Container lifecycle for isolated payload execution.
//!
//! One disposable container per execution, destroyed on every exit path.
//!
//! # Container setup
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                         Payload Container                               │
//! │                                                                         │
//! │  Environment:                                                           │
//! │    HTTP_PROXY / HTTPS_PROXY = http://<host>:<proxy port>  (proxied)     │
//! │    NODE_USE_ENV_PROXY=1                                                 │
//! │                                                                         │
//! │  Mounts:                                                                │
//! │    /workspace ─▶ host workdir (read-only, holds main.js)                │
//! │    /scratch   ─▶ tmpfs, noexec (only writable path)                     │
//! │                                                                         │
//! │  Hardening:                                                             │
//! │    read-only rootfs, all capabilities dropped, no-new-privileges,       │
//! │    non-root user (UID 1000), network none or bridge per mode            │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The image carries only the script runtime: no shell, no package manager,
//! no network utilities. The payload is therefore started by exec'ing the
//! runtime on the mounted entry file directly.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use futures::StreamExt;
use uuid::Uuid;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::executor::mode::ExecutionMode;
use crate::executor::{RunOutput, TRUNCATION_MARKER};

/// Reserved container name prefix; the reclamation sweep matches on it.
pub const CONTAINER_PREFIX: &str = "crucible-";

/// Mount point of the execution's working directory inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Entry file the runtime is pointed at.
pub const PAYLOAD_FILE: &str = "main.js";

/// Manages disposable payload containers.
pub struct ContainerRunner {
    docker: Docker,
    image: String,
    runtime_bin: String,
    kill_grace: Duration,
}

impl ContainerRunner {
    pub fn new(docker: Docker, image: String, runtime_bin: String, kill_grace: Duration) -> Self {
        Self {
            docker,
            image,
            runtime_bin,
            kill_grace,
        }
    }

    /// Check if the Docker daemon is responsive.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    /// Check if the sandbox image exists locally.
    pub async fn image_exists(&self) -> bool {
        self.docker.inspect_image(&self.image).await.is_ok()
    }

    /// Pull the sandbox image. A transient failure is retried once with
    /// backoff before surfacing as `ImagePullFailed`.
    pub async fn pull_image(&self) -> Result<()> {
        match self.pull_image_once().await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(image = %self.image, error = %first, "image pull failed, retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.pull_image_once().await.map_err(|e| Error::ImagePullFailed {
                    image: self.image.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn pull_image_once(&self) -> Result<()> {
        use bollard::image::CreateImageOptions;

        tracing::info!(image = %self.image, "pulling sandbox image");

        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(%status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::ImagePullFailed {
                        image: self.image.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(image = %self.image, "sandbox image ready");
        Ok(())
    }

    /// Execute the payload in a fresh container. The container is removed on
    /// every exit path, including timeout and wait errors.
    pub async fn run_payload(
        &self,
        execution_id: &Uuid,
        workdir: &Path,
        mode: ExecutionMode,
        limits: &Limits,
        env: HashMap<String, String>,
        proxy_port: Option<u16>,
    ) -> Result<RunOutput> {
        let start_time = std::time::Instant::now();

        let container_id = self
            .create_container(execution_id, workdir, mode, limits, env, proxy_port)
            .await?;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&self.docker, &container_id).await;
            return Err(classify_backend_error(e, "container start failed"));
        }

        let waited = tokio::time::timeout(
            limits.wall_clock,
            self.wait_for_exit(&container_id, limits.max_output_bytes),
        )
        .await;

        let result = match waited {
            Ok(Ok(mut output)) => {
                output.duration = start_time.elapsed();
                Ok(output)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Terminate, wait out the grace period, then the force
                // remove below delivers the kill.
                let grace = self.kill_grace.as_secs().max(1) as i64;
                let _ = self
                    .docker
                    .stop_container(&container_id, Some(StopContainerOptions { t: grace }))
                    .await;
                Err(Error::Timeout(limits.wall_clock))
            }
        };

        remove_container(&self.docker, &container_id).await;

        result
    }

    async fn create_container(
        &self,
        execution_id: &Uuid,
        workdir: &Path,
        mode: ExecutionMode,
        limits: &Limits,
        env: HashMap<String, String>,
        proxy_port: Option<u16>,
    ) -> Result<String> {
        let mut env_vec: Vec<String> = env
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        if let Some(port) = proxy_port.filter(|_| mode.uses_proxy()) {
            // host.docker.internal on Mac/Windows, the bridge gateway on Linux.
            let proxy_host = if cfg!(target_os = "linux") {
                "172.17.0.1"
            } else {
                "host.docker.internal"
            };
            let proxy_url = format!("http://{}:{}", proxy_host, port);

            env_vec.push(format!("http_proxy={}", proxy_url));
            env_vec.push(format!("https_proxy={}", proxy_url));
            env_vec.push(format!("HTTP_PROXY={}", proxy_url));
            env_vec.push(format!("HTTPS_PROXY={}", proxy_url));
            // Make the runtime's built-in fetch honor the proxy variables.
            env_vec.push("NODE_USE_ENV_PROXY=1".to_string());
        }

        let network_mode = if mode.has_network() { "bridge" } else { "none" };

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                workdir.display(),
                WORKSPACE_MOUNT
            )]),
            memory: Some(limits.memory_bytes as i64),
            cpu_shares: Some(limits.cpu_share as i64),
            network_mode: Some(network_mode.to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(true),
            // The only writable path; noexec keeps dropped files inert.
            tmpfs: Some(
                [(
                    "/scratch".to_string(),
                    "rw,noexec,nosuid,size=64m".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                self.runtime_bin.clone(),
                format!("{}/{}", WORKSPACE_MOUNT, PAYLOAD_FILE),
            ]),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env: Some(env_vec),
            host_config: Some(host_config),
            user: Some("1000:1000".to_string()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("{}{}", CONTAINER_PREFIX, execution_id),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify_backend_error(e, "container creation failed"))?;

        Ok(response.id)
    }

    /// Wait for the container to exit, then collect output and OOM status.
    async fn wait_for_exit(&self, container_id: &str, max_output: usize) -> Result<RunOutput> {
        let mut wait_stream = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(e)) => {
                // Bollard surfaces non-zero exits from some daemons as a
                // wait error carrying the status code; fall back to inspect.
                tracing::debug!(error = %e, "wait_container error, inspecting for exit code");
                self.inspect_exit_code(container_id).await?
            }
            None => {
                return Err(Error::internal("container wait stream ended unexpectedly"));
            }
        };

        let oom_killed = self.inspect_oom(container_id).await;
        let (stdout, stderr, truncated) = self.collect_logs(container_id, max_output).await?;

        Ok(RunOutput {
            exit_code,
            stdout,
            stderr,
            duration: Duration::ZERO, // set by caller
            truncated,
            oom_killed,
        })
    }

    async fn inspect_exit_code(&self, container_id: &str) -> Result<i64> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| Error::internal(format!("container inspect failed: {}", e)))?;

        Ok(inspect
            .state
            .as_ref()
            .and_then(|s| s.exit_code)
            .unwrap_or(-1))
    }

    async fn inspect_oom(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .state
                .as_ref()
                .and_then(|s| s.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                tracing::debug!(error = %e, "container inspect failed, assuming no OOM");
                false
            }
        }
    }

    /// Collect stdout and stderr into two independent buffers, each capped
    /// at `max_output` bytes with a truncation marker appended.
    async fn collect_logs(
        &self,
        container_id: &str,
        max_output: usize,
    ) -> Result<(String, String, bool)> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut truncated = false;

        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) => {
                    truncated |= append_capped(&mut stdout, &message, max_output);
                }
                Ok(LogOutput::StdErr { message }) => {
                    truncated |= append_capped(&mut stderr, &message, max_output);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "error reading container logs");
                }
            }
        }

        if truncated {
            if stdout.len() >= max_output {
                stdout.push_str(TRUNCATION_MARKER);
            }
            if stderr.len() >= max_output {
                stderr.push_str(TRUNCATION_MARKER);
            }
        }

        Ok((stdout, stderr, truncated))
    }

    /// Remove every container carrying the reserved name prefix. Run at
    /// startup to reclaim leftovers from prior crashes.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_PREFIX.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for container in containers {
            if let Some(id) = container.id {
                remove_container(&self.docker, &id).await;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "reclaimed orphaned containers");
        }

        Ok(removed)
    }
}

/// Sort a bollard error into a sandbox error. A daemon that answered with
/// an error status is a start failure; anything else (socket gone, I/O) is
/// the backend being unreachable, which latches the engine unavailable.
fn classify_backend_error(error: bollard::errors::Error, context: &str) -> Error {
    match error {
        bollard::errors::Error::DockerResponseServerError { .. } => Error::StartFailed {
            reason: format!("{}: {}", context, error),
        },
        other => Error::Docker(other),
    }
}

/// Append log bytes to a buffer up to the cap; returns true if truncated.
fn append_capped(buffer: &mut String, message: &[u8], cap: usize) -> bool {
    let text = String::from_utf8_lossy(message);
    if buffer.len() >= cap {
        return true;
    }
    let remaining = cap - buffer.len();
    if text.len() > remaining {
        let mut cut = remaining;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&text[..cut]);
        true
    } else {
        buffer.push_str(&text);
        false
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let result = docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;

    if let Err(e) = result {
        // Already-gone containers are fine; anything else is worth a warning.
        let message = e.to_string();
        if !message.contains("404") && !message.contains("No such container") {
            tracing::warn!(container_id, error = %message, "container removal failed");
        }
    }
}

/// Connect to the Docker daemon.
///
/// Tries these locations in order:
/// 1. `DOCKER_HOST` env var (bollard default)
/// 2. `/var/run/docker.sock` (Linux default)
/// 3. `~/.docker/run/docker.sock` (Docker Desktop on macOS)
pub async fn connect_docker() -> Result<Docker> {
    if let Ok(docker) = Docker::connect_with_local_defaults()
        && docker.ping().await.is_ok()
    {
        return Ok(docker);
    }

    if let Some(home) = std::env::var_os("HOME") {
        let desktop_sock = std::path::Path::new(&home).join(".docker/run/docker.sock");
        if desktop_sock.exists() {
            let sock_str = desktop_sock.to_string_lossy();
            if let Ok(docker) =
                Docker::connect_with_socket(&sock_str, 120, bollard::API_DEFAULT_VERSION)
                && docker.ping().await.is_ok()
            {
                return Ok(docker);
            }
        }
    }

    Err(Error::BackendUnavailable {
        reason: "docker socket not found".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_capped_under_limit() {
        let mut buf = String::new();
        let truncated = append_capped(&mut buf, b"hello", 100);
        assert!(!truncated);
        assert_eq!(buf, "hello");
    }

    #[test]
    fn test_append_capped_over_limit() {
        let mut buf = String::new();
        let truncated = append_capped(&mut buf, b"hello world", 5);
        assert!(truncated);
        assert_eq!(buf, "hello");

        // Further appends are dropped entirely.
        let truncated = append_capped(&mut buf, b"more", 5);
        assert!(truncated);
        assert_eq!(buf, "hello");
    }

    #[test]
    fn test_append_capped_respects_char_boundaries() {
        let mut buf = String::new();
        // "é" is two bytes; a cap of 1 must not split it.
        let truncated = append_capped(&mut buf, "é".as_bytes(), 1);
        assert!(truncated);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_docker_connection() {
        // Requires a running Docker daemon; skip when unavailable.
        let result = connect_docker().await;
        if result.is_err() {
            eprintln!("Skipping Docker test: Docker not available");
            return;
        }

        let docker = result.unwrap();
        let runner = ContainerRunner::new(
            docker,
            "alpine:latest".to_string(),
            "/bin/true".to_string(),
            Duration::from_secs(2),
        );
        let _available = runner.is_available().await;
    }
}
