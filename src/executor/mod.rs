//! Sandbox runner: executes one payload per disposable, isolated child
//! environment and collects its output.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                  │
//! │                                                                       │
//! │   run_payload(id, payload, env, mode, limits)                         │
//! │         │                                                             │
//! │         ▼                                                             │
//! │   ┌────────────┐   ┌────────────┐   ┌───────────────┐   ┌─────────┐  │
//! │   │ Acquire    │──▶│ Workdir    │──▶│ Container or  │──▶│ Cleanup │  │
//! │   │ slot       │   │ + payload  │   │ host process  │   │ always  │  │
//! │   └────────────┘   └────────────┘   └───────────────┘   └─────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `initialize` connects to the backend, ensures the image is present,
//! verifies the image invariant (runtime only, no shell or package
//! manager), and reclaims orphans from prior crashes. A backend failure
//! inhibits further attempts until a health probe succeeds.

pub mod container;
pub mod direct;
pub mod mode;
pub mod probe;
pub mod queue;
pub mod workdir;

pub use container::{CONTAINER_PREFIX, ContainerRunner, PAYLOAD_FILE, connect_docker};
pub use mode::ExecutionMode;
pub use probe::ProbeReport;
pub use queue::ExecutionGate;
pub use workdir::{WORKDIR_PREFIX, Workdir};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{Config, Limits};
use crate::error::{Error, Result};

/// Marker appended to a stream that hit its output cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Output of one payload run, whatever the mode.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub truncated: bool,
    pub oom_killed: bool,
}

/// The sandbox runner.
pub struct Engine {
    config: Config,
    runner: RwLock<Option<ContainerRunner>>,
    gate: ExecutionGate,
    available: AtomicBool,
    initialized: AtomicBool,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let gate = ExecutionGate::new(config.max_concurrent_executions, config.queue_deadline);
        Self {
            config,
            runner: RwLock::new(None),
            gate,
            available: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the chosen backend is usable right now.
    pub async fn is_available(&self) -> bool {
        if !self.config.mode.is_isolated() {
            return true;
        }
        match self.runner.read().await.as_ref() {
            Some(runner) => runner.is_available().await,
            None => connect_docker().await.is_ok(),
        }
    }

    /// Connect to the backend, prepare the image, verify the image
    /// invariant, and reclaim orphans. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        workdir::sweep_orphans(&self.config.workdir_root).await?;

        if self.config.mode.is_isolated() {
            let docker = connect_docker().await?;
            let runner = ContainerRunner::new(
                docker,
                self.config.image.clone(),
                self.config.runtime_bin.clone(),
                self.config.kill_grace,
            );

            if !runner.image_exists().await {
                if self.config.auto_pull_image {
                    runner.pull_image().await?;
                } else {
                    return Err(Error::StartFailed {
                        reason: format!(
                            "image {} not found and auto-pull is disabled",
                            self.config.image
                        ),
                    });
                }
            }

            runner.sweep_orphans().await?;

            let report = probe::probe_image(&runner, &self.config).await?;
            if !report.is_clean() {
                return Err(Error::StartFailed {
                    reason: format!(
                        "image {} violates the runtime-only invariant: runtime_ok={}, forbidden={:?}",
                        self.config.image, report.runtime_ok, report.forbidden_present
                    ),
                });
            }

            *self.runner.write().await = Some(runner);
        }

        self.available.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);

        tracing::info!(mode = %self.config.mode, "execution engine initialized");
        Ok(())
    }

    /// Release backend resources. Workdirs are per-run and already gone.
    pub async fn shutdown(&self) {
        *self.runner.write().await = None;
        self.available.store(false, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("execution engine shut down");
    }

    /// Re-check the backend; a success lifts the unavailability latch.
    pub async fn health_probe(&self) -> bool {
        let healthy = self.is_available().await;
        if healthy && self.initialized.load(Ordering::SeqCst) {
            self.available.store(true, Ordering::SeqCst);
        }
        healthy
    }

    /// Execute one payload. The working directory and any container are
    /// released before this returns, on every path.
    pub async fn run_payload(
        &self,
        execution_id: &Uuid,
        payload: &str,
        env: HashMap<String, String>,
        mode: ExecutionMode,
        limits: &Limits,
        proxy_port: Option<u16>,
    ) -> Result<RunOutput> {
        let _permit = self.gate.acquire().await?;

        let workdir = Workdir::create(&self.config.workdir_root, execution_id).await?;
        let entry = match workdir.write_file(PAYLOAD_FILE, payload).await {
            Ok(path) => path,
            Err(e) => {
                workdir.cleanup().await;
                return Err(e);
            }
        };

        let result = if mode.is_isolated() {
            self.run_isolated(execution_id, workdir.path(), mode, limits, env, proxy_port)
                .await
        } else {
            direct::run_payload(&self.config.host_runtime_bin, &entry, limits, env).await
        };

        workdir.cleanup().await;

        result
    }

    async fn run_isolated(
        &self,
        execution_id: &Uuid,
        workdir: &std::path::Path,
        mode: ExecutionMode,
        limits: &Limits,
        env: HashMap<String, String>,
        proxy_port: Option<u16>,
    ) -> Result<RunOutput> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable {
                reason: "backend marked unavailable; waiting for a successful health probe"
                    .to_string(),
            });
        }

        let runner = self.runner.read().await;
        let runner = runner.as_ref().ok_or_else(|| Error::BackendUnavailable {
            reason: "engine not initialized".to_string(),
        })?;

        let result = runner
            .run_payload(execution_id, workdir, mode, limits, env, proxy_port)
            .await;

        if let Err(Error::Docker(e)) = &result {
            tracing::error!(error = %e, "backend failure, inhibiting further executions");
            self.available.store(false, Ordering::SeqCst);
        }

        result
    }
}
