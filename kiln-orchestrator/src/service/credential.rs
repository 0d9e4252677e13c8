//! Credential Service
//!
//! Stores and reads credentials and SSH keys. Secret values never reach a
//! log line; errors name the credential key only.

use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::dto::credential::NewCredential;
use sqlx::PgPool;
use std::fmt;

use crate::repository::credential_repository;

/// Service error type
#[derive(Debug)]
pub enum CredentialServiceError {
    NotFound(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for CredentialServiceError {
    fn from(err: sqlx::Error) -> Self {
        CredentialServiceError::DatabaseError(err)
    }
}

impl fmt::Display for CredentialServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialServiceError::NotFound(key) => write!(f, "no credential found for {}", key),
            CredentialServiceError::ValidationError(msg) => write!(f, "{}", msg),
            CredentialServiceError::DatabaseError(err) => write!(f, "database error: {}", err),
        }
    }
}

impl std::error::Error for CredentialServiceError {}

pub async fn add_credential(pool: &PgPool, cred: &NewCredential) -> Result<i64, CredentialServiceError> {
    validate_credential(cred)?;
    let id = credential_repository::upsert(pool, cred).await?;

    tracing::info!(
        "Stored {} credential {} for account {}",
        cred.cred_type.as_str(),
        cred.identifier,
        cred.account
    );
    Ok(id)
}

pub async fn get_credential(
    pool: &PgPool,
    cred_type: CredentialType,
    identifier: &str,
    account: &str,
) -> Result<Credential, CredentialServiceError> {
    credential_repository::find(pool, cred_type, identifier, account)
        .await?
        .ok_or_else(|| {
            CredentialServiceError::NotFound(format!("{}/{}/{}", account, cred_type.as_str(), identifier))
        })
}

pub async fn add_ssh_key(pool: &PgPool, path: &str, key: &str) -> Result<(), CredentialServiceError> {
    if path.is_empty() {
        return Err(CredentialServiceError::ValidationError("ssh key path cannot be empty".to_string()));
    }
    credential_repository::put_ssh_key(pool, path, key).await?;

    tracing::info!("Stored ssh key at {}", path);
    Ok(())
}

pub async fn ssh_key_exists(pool: &PgPool, path: &str) -> Result<bool, CredentialServiceError> {
    Ok(credential_repository::ssh_key_exists(pool, path).await?)
}

/// A one-off opaque token handed to a build for secret retrieval
pub fn create_throwaway_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// =============================================================================
// Validation
// =============================================================================

fn validate_credential(cred: &NewCredential) -> Result<(), CredentialServiceError> {
    if cred.account.trim().is_empty() {
        return Err(CredentialServiceError::ValidationError("account cannot be empty".to_string()));
    }
    if cred.identifier.trim().is_empty() {
        return Err(CredentialServiceError::ValidationError("identifier cannot be empty".to_string()));
    }
    if cred.secret.is_empty() {
        return Err(CredentialServiceError::ValidationError("secret cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cred() -> NewCredential {
        NewCredential {
            account: "acme".to_string(),
            identifier: "docker".to_string(),
            cred_type: CredentialType::Repo,
            sub_type: "docker".to_string(),
            secret: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_validate_credential() {
        assert!(validate_credential(&new_cred()).is_ok());

        let mut cred = new_cred();
        cred.account = " ".to_string();
        assert!(validate_credential(&cred).is_err());

        let mut cred = new_cred();
        cred.secret = String::new();
        let err = validate_credential(&cred).unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_throwaway_tokens_are_unique() {
        let a = create_throwaway_token();
        let b = create_throwaway_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
