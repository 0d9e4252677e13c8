//! Kiln Runner
//!
//! A worker that claims queued builds from the orchestrator and runs them on
//! a build substrate: a docker container, a vagrant VM or the host itself.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: Build storage and credentials over the orchestrator API
//! - Builders: Substrate setup, stage execution and teardown
//! - Launcher: Setup, integrations and stages of one build
//! - Scheduler: Build claiming, timeouts and output flushing
//!
//! Build output is streamed line by line into a per-build channel and
//! appended to the stored log periodically.

mod basher;
mod builder;
mod cleaner;
mod config;
mod integrations;
mod launcher;
mod logstream;
mod repository;
mod scheduler;

use anyhow::{Context, Result};
use kiln_core::interface::{BuildStorage, CredentialStore};
use kiln_core::metrics::{MetricsSink, TracingMetrics};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::basher::Basher;
use crate::builder::BuilderFactory;
use crate::config::Config;
use crate::integrations::default_integrations;
use crate::launcher::Launcher;
use crate::repository::{HttpBuildStorage, HttpCredentialStore};
use crate::scheduler::BuildPoller;
use kiln_client::OrchestratorClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kiln Runner");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: runner_id={}, orchestrator_url={}, builder={}, machine_tags={:?}",
        config.runner_id, config.orchestrator_url, config.builder_kind, config.machine_tags
    );

    // Initialize orchestrator client
    let client = Arc::new(OrchestratorClient::new(config.orchestrator_url.clone()));
    wait_for_orchestrator(&client).await?;
    info!("Orchestrator is reachable");

    let storage: Arc<dyn BuildStorage> = Arc::new(HttpBuildStorage::new(Arc::clone(&client)));
    let creds: Arc<dyn CredentialStore> = Arc::new(HttpCredentialStore::new(Arc::clone(&client)));
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);

    let basher = Basher::new(
        &config.bitbucket_download_url,
        &config.loopback_ip,
        &config.prefix,
    )
    .context("Invalid build script settings")?;
    let factory = BuilderFactory::new(
        config.builder_kind,
        basher,
        &config.docker_socket,
        &config.vault_addr,
        Arc::clone(&metrics),
    )
    .context("Failed to initialize builder")?;

    let launcher = Launcher::new(
        Arc::clone(&storage),
        creds,
        factory.cleaner(),
        metrics,
        default_integrations(),
        config.template_port.clone(),
    );

    let poller = BuildPoller::new(
        config.clone(),
        client,
        storage,
        Arc::new(factory),
        Arc::new(launcher),
    );

    info!("Runner initialized successfully");
    info!(
        "Poll interval: {:?}, Output flush interval: {:?}, Build timeout: {:?}",
        config.poll_interval, config.log_send_interval, config.build_timeout
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal");
        signal_token.cancel();
    });

    if let Err(e) = poller.run(shutdown).await {
        error!("Poller error: {:#}", e);
        return Err(e);
    }

    info!("Runner stopped");
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Waits for the orchestrator with exponential backoff
///
/// The orchestrator may not be ready yet when the runner starts (common in
/// container environments).
async fn wait_for_orchestrator(client: &OrchestratorClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.health().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Reached orchestrator after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Orchestrator unreachable after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Orchestrator unreachable: {}", e));
                }

                warn!(
                    "Orchestrator not reachable (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
