//! Credential store over HTTP
//!
//! Secrets pass through here on their way to a builder. Errors name the
//! credential key only, never its value.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_client::OrchestratorClient;
use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::error::CredentialError;
use kiln_core::interface::CredentialStore;
use std::sync::Arc;

/// [`CredentialStore`] backed by the orchestrator API
pub struct HttpCredentialStore {
    client: Arc<OrchestratorClient>,
}

impl HttpCredentialStore {
    pub fn new(client: Arc<OrchestratorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    async fn get_cred(
        &self,
        cred_type: CredentialType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential, CredentialError> {
        match self.client.get_credential(cred_type, identifier, account).await {
            Ok(cred) => Ok(cred),
            Err(e) if e.is_not_found() => Err(CredentialError::NotFound(format!(
                "{}/{}/{}",
                account,
                cred_type.as_str(),
                identifier
            ))),
            Err(e) => Err(CredentialError::Other(anyhow::Error::new(e).context(format!(
                "Failed to fetch {} credential {}",
                cred_type.as_str(),
                identifier
            )))),
        }
    }

    async fn add_ssh_key(&self, path: &str, key: &str) -> Result<()> {
        self.client
            .add_ssh_key(path, key)
            .await
            .with_context(|| format!("Failed to store ssh key at {}", path))
    }

    async fn check_ssh_key_exists(&self, path: &str) -> Result<bool> {
        self.client
            .ssh_key_exists(path)
            .await
            .with_context(|| format!("Failed to check ssh key at {}", path))
    }

    async fn create_throwaway_token(&self) -> Result<String> {
        self.client
            .throwaway_token()
            .await
            .context("Failed to create throwaway token")
    }
}
