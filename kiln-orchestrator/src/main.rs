//! Kiln Orchestrator
//!
//! Owns build state. Inbound commit events go through the signaler, which
//! stores a summary and queues a build task; runners claim tasks and report
//! stage results and output back over the HTTP API.

use anyhow::Context;
use kiln_core::interface::{BuildQueue, BuildStorage, CredentialStore};
use kiln_core::metrics::{MetricsSink, TracingMetrics};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod signaler;
pub mod storage;

use crate::api::AppState;
use crate::config::Config;
use crate::signaler::Signaler;
use crate::storage::{PgBuildQueue, PgBuildStorage, PgCredentialStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!("Connecting to database...");

    // Create database connection pool
    let pool = db::create_pool(&config.database_url, config.max_db_connections)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    // Run migrations
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let storage: Arc<dyn BuildStorage> = Arc::new(PgBuildStorage::new(pool.clone()));
    let queue: Arc<dyn BuildQueue> = Arc::new(PgBuildQueue::new(pool.clone()));
    let creds: Arc<dyn CredentialStore> = Arc::new(PgCredentialStore::new(pool.clone()));
    let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetrics);
    let signaler = Arc::new(Signaler::new(storage, queue, creds, metrics));

    // Subscription chaining and polling need a VCS handler to read branch
    // heads; none is configured here.
    tracing::info!("No VCS handler configured, subscription chaining is disabled");

    // Build router with all API endpoints
    let app = api::create_router(AppState {
        pool,
        signaler,
        chainer: None,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
