//! Credential API Handlers
//!
//! Credential and SSH key storage. Request bodies carrying secrets are never
//! logged.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::dto::credential::{AddSshKey, CreatedCredential, NewCredential, SshKeyExists, ThrowawayToken};
use serde::Deserialize;
use sqlx::PgPool;

use crate::api::error::{ApiError, ApiResult};
use crate::service::credential_service;

/// GET /api/credentials/{account}/{cred_type}/{identifier}
pub async fn get_credential(
    State(pool): State<PgPool>,
    Path((account, cred_type, identifier)): Path<(String, String, String)>,
) -> ApiResult<Json<Credential>> {
    let cred_type = CredentialType::parse(&cred_type)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown credential type {:?}", cred_type)))?;

    let cred = credential_service::get_credential(&pool, cred_type, &identifier, &account).await?;
    Ok(Json(cred))
}

/// PUT /api/credentials
pub async fn add_credential(
    State(pool): State<PgPool>,
    Json(cred): Json<NewCredential>,
) -> ApiResult<Json<CreatedCredential>> {
    let id = credential_service::add_credential(&pool, &cred).await?;
    Ok(Json(CreatedCredential { id }))
}

/// PUT /api/credentials/ssh
pub async fn add_ssh_key(State(pool): State<PgPool>, Json(req): Json<AddSshKey>) -> ApiResult<StatusCode> {
    credential_service::add_ssh_key(&pool, &req.path, &req.key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SshKeyQuery {
    pub path: String,
}

/// GET /api/credentials/ssh/exists?path=
pub async fn ssh_key_exists(
    State(pool): State<PgPool>,
    Query(query): Query<SshKeyQuery>,
) -> ApiResult<Json<SshKeyExists>> {
    let exists = credential_service::ssh_key_exists(&pool, &query.path).await?;
    Ok(Json(SshKeyExists { exists }))
}

/// POST /api/credentials/token
pub async fn throwaway_token() -> Json<ThrowawayToken> {
    Json(ThrowawayToken {
        token: credential_service::create_throwaway_token(),
    })
}
