//! Signal API Handler
//!
//! Entry point for decoded commit events.

use axum::{Json, extract::State};
use kiln_core::dto::signal::{SignalRequest, SignalResponse};
use std::sync::Arc;

use crate::api::error::ApiResult;
use crate::signaler::Signaler;

/// POST /api/signal
/// Returns the outcome; a NotViable event is a 200 with `outcome: not_viable`
pub async fn signal(
    State(signaler): State<Arc<Signaler>>,
    Json(req): Json<SignalRequest>,
) -> ApiResult<Json<SignalResponse>> {
    tracing::debug!(hash = %req.hash, "Signal for {} on {}", req.full_name, req.branch);

    Ok(Json(signaler.signal(&req).await?))
}
