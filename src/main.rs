//! Host process for the execution engine.
//!
//! `run` brings the engine up (backend connection, image pull, invariant
//! probe, orphan reclamation) and holds it until interrupted. Exit codes
//! reflect startup-time failures only: 0 on clean shutdown, non-zero when
//! the backend is unreachable or startup validation fails.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crucible::config::Config;
use crucible::executor::{ContainerRunner, Engine, connect_docker, probe, workdir};

#[derive(Parser, Debug)]
#[command(name = "crucible", about = "Policy-enforcing sandboxed execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the engine and hold it until interrupted.
    Run,
    /// Run the sandbox-image invariant probe and print the verdict.
    Probe,
    /// Reclaim orphaned working directories and containers, then exit.
    Sweep,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let outcome = match cli.command {
        Command::Run => run(config).await,
        Command::Probe => run_probe(config).await,
        Command::Sweep => run_sweep(config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::new(config));
    engine.initialize().await?;

    tracing::info!("crucible ready; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

async fn run_probe(config: Config) -> anyhow::Result<()> {
    let docker = connect_docker().await?;
    let runner = ContainerRunner::new(
        docker,
        config.image.clone(),
        config.runtime_bin.clone(),
        config.kill_grace,
    );

    if !runner.image_exists().await {
        runner.pull_image().await?;
    }

    let report = probe::probe_image(&runner, &config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_clean() {
        Ok(())
    } else {
        anyhow::bail!("image {} violates the runtime-only invariant", config.image)
    }
}

async fn run_sweep(config: Config) -> anyhow::Result<()> {
    let dirs = workdir::sweep_orphans(&config.workdir_root).await?;
    println!("removed {} orphaned working directories", dirs);

    match connect_docker().await {
        Ok(docker) => {
            let runner = ContainerRunner::new(
                docker,
                config.image.clone(),
                config.runtime_bin.clone(),
                config.kill_grace,
            );
            let containers = runner.sweep_orphans().await?;
            println!("removed {} orphaned containers", containers);
        }
        Err(e) => {
            tracing::warn!(error = %e, "skipping container sweep, backend unreachable");
        }
    }

    Ok(())
}
