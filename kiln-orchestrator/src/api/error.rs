//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_core::error::CredentialError;

use crate::service::build_service::BuildError;
use crate::service::credential_service::CredentialServiceError;
use crate::service::subscription_service::SubscriptionError;
use crate::signaler::SignalError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    DatabaseError(sqlx::Error),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::NotFound(_) => ApiError::NotFound(err.to_string()),
            BuildError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            BuildError::InvalidTask(msg) => ApiError::InternalError(msg),
            BuildError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<CredentialServiceError> for ApiError {
    fn from(err: CredentialServiceError) -> Self {
        match err {
            CredentialServiceError::NotFound(_) => ApiError::NotFound(err.to_string()),
            CredentialServiceError::ValidationError(msg) => ApiError::BadRequest(msg),
            CredentialServiceError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::ValidationError(msg) => ApiError::BadRequest(msg),
            SubscriptionError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::BranchFilter { .. } | SignalError::Config(_) | SignalError::FullName(_) => {
                ApiError::BadRequest(err.to_string())
            }
            SignalError::Credential(CredentialError::NotFound(_)) => ApiError::NotFound(err.to_string()),
            // Soft outcomes never reach here; the signaler answers them itself.
            SignalError::NotViable(nv) => ApiError::BadRequest(nv.reason),
            SignalError::Credential(CredentialError::Other(e)) | SignalError::Infrastructure(e) => {
                ApiError::InternalError(format!("{:#}", e))
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
