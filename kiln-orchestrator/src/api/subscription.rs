//! Subscription API Handlers

use axum::{Json, extract::State, http::StatusCode};
use kiln_core::domain::summary::ActiveSubscription;
use kiln_core::dto::subscription::NewSubscription;
use sqlx::PgPool;

use crate::api::error::ApiResult;
use crate::service::subscription_service;

/// POST /api/subscriptions
pub async fn add_subscription(
    State(pool): State<PgPool>,
    Json(sub): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<ActiveSubscription>)> {
    let created = subscription_service::add_subscription(&pool, &sub).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/subscriptions
pub async fn list_subscriptions(State(pool): State<PgPool>) -> ApiResult<Json<Vec<ActiveSubscription>>> {
    Ok(Json(subscription_service::list_subscriptions(&pool).await?))
}
