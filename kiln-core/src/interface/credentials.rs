use anyhow::Result;
use async_trait::async_trait;

use crate::domain::credential::{Credential, CredentialType};
use crate::error::CredentialError;

/// Access to decrypted credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Looks up a credential; a missing one is `CredentialError::NotFound`
    async fn get_cred(
        &self,
        cred_type: CredentialType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential, CredentialError>;

    async fn add_ssh_key(&self, path: &str, key: &str) -> Result<()>;

    async fn check_ssh_key_exists(&self, path: &str) -> Result<bool>;

    /// Creates a short-lived token a build can use to read its secrets
    async fn create_throwaway_token(&self) -> Result<String>;
}
