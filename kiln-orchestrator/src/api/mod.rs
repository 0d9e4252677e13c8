//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod build;
pub mod credential;
pub mod error;
pub mod health;
pub mod queue;
pub mod signal;
pub mod subscription;

use axum::{
    Router,
    extract::FromRef,
    routing::{get, post, put},
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::signaler::Signaler;
use crate::signaler::subscription::SubscriptionChainer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub signaler: Arc<Signaler>,
    /// Present only when a VCS handler is configured
    pub chainer: Option<Arc<SubscriptionChainer>>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<Signaler> {
    fn from_ref(state: &AppState) -> Self {
        state.signaler.clone()
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Inbound events
        .route("/api/signal", post(signal::signal))
        // Dispatch queue
        .route("/api/queue/claim", post(queue::claim_build))
        // Build endpoints
        .route("/api/builds", get(build::list_builds).post(build::create_summary))
        .route("/api/builds/active", get(build::is_building))
        .route("/api/builds/{id}", get(build::get_build))
        .route(
            "/api/builds/{id}/stages",
            get(build::get_stages).post(build::add_stage),
        )
        .route(
            "/api/builds/{id}/output",
            get(build::get_output).post(build::add_output),
        )
        .route("/api/builds/{id}/queued", post(build::set_queued))
        .route("/api/builds/{id}/start", post(build::start_build))
        .route("/api/builds/{id}/finish", post(build::finish_build))
        .route("/api/builds/{id}/prestart-failed", post(build::fail_prestart))
        // Credential endpoints
        .route("/api/credentials", put(credential::add_credential))
        .route("/api/credentials/ssh", put(credential::add_ssh_key))
        .route("/api/credentials/ssh/exists", get(credential::ssh_key_exists))
        .route("/api/credentials/token", post(credential::throwaway_token))
        .route(
            "/api/credentials/{account}/{cred_type}/{identifier}",
            get(credential::get_credential),
        )
        // Subscription endpoints
        .route(
            "/api/subscriptions",
            get(subscription::list_subscriptions).post(subscription::add_subscription),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
