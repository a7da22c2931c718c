//! rpool Runner Manager
//!
//! Keeps each configured runner group at its desired number of ephemeral
//! GitHub Actions runners, each in its own Docker container.
//!
//! On SIGINT or SIGTERM every runner is torn down (container removed,
//! registration deleted) before the process exits. A second signal abandons
//! the drain and exits with status 1.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rpool_runner_manager::config::Config;
use rpool_runner_manager::docker::DockerRuntime;
use rpool_runner_manager::github::GitHubClient;
use rpool_runner_manager::reconciler::ReconcilerConfig;
use rpool_runner_manager::{RunnerPool, WorkerServices};

#[derive(Parser, Debug)]
#[command(name = "runner-manager", version, about = "Ephemeral GitHub Actions runner pool manager")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "RUNNER_POOL_CONFIG")]
    config: PathBuf,
}

struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())
                .context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("failed to install SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "Starting rpool runner manager");

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    for group in &config.groups {
        info!(
            group = %group.name,
            count = group.count,
            owner = %group.repository.owner,
            repository = %group.repository.name,
            image = %group.image,
            "Runner group configured"
        );
    }

    let runtime = DockerRuntime::new(&config.docker_socket);
    if !runtime.socket_exists() {
        warn!(socket = %config.docker_socket.display(), "Docker socket not found");
    }
    let platform =
        GitHubClient::new(&config.github_api_url).context("failed to build GitHub client")?;

    let services = WorkerServices {
        runtime: Arc::new(runtime),
        platform: Arc::new(platform),
        github_url: config.github_url.clone(),
        teardown_timeout: config.teardown_timeout,
    };

    let mut signals = Signals::install()?;

    let pool = RunnerPool::start(
        config.groups,
        services,
        ReconcilerConfig {
            backoff: config.backoff,
        },
    );

    let received = signals.recv().await;
    info!(signal = received, "Received shutdown signal, draining workers");

    tokio::select! {
        report = pool.shutdown() => {
            info!(
                workers = report.workers,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Runner manager shutdown complete"
            );
            Ok(())
        }
        received = signals.recv() => {
            error!(signal = received, "Received second signal, abandoning drain");
            std::process::exit(1);
        }
    }
}
