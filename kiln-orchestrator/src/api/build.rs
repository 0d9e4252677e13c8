//! Build API Handlers
//!
//! HTTP endpoints for build summaries, stage results and output.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use kiln_core::domain::stage::StageResult;
use kiln_core::domain::summary::{BuildStatus, BuildSummary, NewBuildSummary};
use kiln_core::dto::build::{BuildActivity, BuildDetails, CreatedBuild, FinishBuild};
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::build_service;
use crate::signaler::subscription::SubscriptionChainer;

// =============================================================================
// Summary Lifecycle Endpoints
// =============================================================================

/// POST /api/builds
pub async fn create_summary(
    State(pool): State<PgPool>,
    Json(summary): Json<NewBuildSummary>,
) -> ApiResult<(StatusCode, Json<CreatedBuild>)> {
    let build_id = build_service::create_summary(&pool, &summary).await?;
    Ok((StatusCode::CREATED, Json(CreatedBuild { build_id })))
}

/// POST /api/builds/{id}/queued
pub async fn set_queued(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    build_service::set_queued(&pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/builds/{id}/start
pub async fn start_build(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    build_service::start_build(&pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/builds/{id}/finish
///
/// A passing build kicks off its subscribers in the background.
pub async fn finish_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<FinishBuild>,
) -> ApiResult<StatusCode> {
    let summary = build_service::finish_build(&state.pool, id, req.failed, req.duration).await?;

    if summary.status == BuildStatus::Passed {
        if let Some(chainer) = state.chainer.clone() {
            tokio::spawn(chain_subscribers(chainer, summary));
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn chain_subscribers(
    chainer: Arc<SubscriptionChainer>,
    summary: BuildSummary,
) {
    match chainer.on_build_passed(&summary).await {
        Ok(responses) if !responses.is_empty() => {
            tracing::info!(build_id = summary.id, "Signaled {} subscriber build(s)", responses.len());
        }
        Ok(_) => {}
        Err(e) => tracing::error!(build_id = summary.id, "Subscription chaining failed: {:#}", e),
    }
}

/// POST /api/builds/{id}/prestart-failed
pub async fn fail_prestart(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    build_service::fail_prestart(&pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Query Endpoints
// =============================================================================

/// GET /api/builds
pub async fn list_builds(State(pool): State<PgPool>) -> ApiResult<Json<Vec<BuildSummary>>> {
    tracing::debug!("Listing all builds");

    Ok(Json(build_service::list_builds(&pool).await?))
}

/// GET /api/builds/{id}
pub async fn get_build(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<Json<BuildDetails>> {
    tracing::debug!("Getting build: {}", id);

    Ok(Json(build_service::get_details(&pool, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    pub hash: String,
}

/// GET /api/builds/active?hash=
pub async fn is_building(
    State(pool): State<PgPool>,
    Query(query): Query<ActiveQuery>,
) -> ApiResult<Json<BuildActivity>> {
    let building = build_service::is_building(&pool, &query.hash).await?;
    Ok(Json(BuildActivity { building }))
}

// =============================================================================
// Stage Details & Output Endpoints
// =============================================================================

/// POST /api/builds/{id}/stages
pub async fn add_stage(
    State(pool): State<PgPool>,
    Path(id): Path<i64>,
    Json(result): Json<StageResult>,
) -> ApiResult<StatusCode> {
    build_service::add_stage(&pool, id, &result).await?;
    Ok(StatusCode::CREATED)
}

/// GET /api/builds/{id}/stages
pub async fn get_stages(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<Json<Vec<StageResult>>> {
    Ok(Json(build_service::get_stages(&pool, id).await?))
}

/// POST /api/builds/{id}/output
/// Appends a raw output chunk
pub async fn add_output(
    State(pool): State<PgPool>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    build_service::add_output(&pool, id, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/builds/{id}/output
pub async fn get_output(State(pool): State<PgPool>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    let output = build_service::get_output(&pool, id).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], output))
}
