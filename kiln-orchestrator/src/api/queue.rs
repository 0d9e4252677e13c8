//! Queue API Handlers

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_core::dto::build::ClaimBuild;
use sqlx::PgPool;

use crate::api::error::ApiResult;
use crate::service::build_service;

/// POST /api/queue/claim
/// Hands the oldest queued task the runner can run, or 204 when there is none
pub async fn claim_build(State(pool): State<PgPool>, Json(req): Json<ClaimBuild>) -> ApiResult<Response> {
    match build_service::claim_build(&pool, &req.runner_id, &req.machine_tags).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
