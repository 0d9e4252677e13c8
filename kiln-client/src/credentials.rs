//! Credential endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::dto::credential::{
    AddSshKey, CreatedCredential, NewCredential, SshKeyExists, ThrowawayToken,
};

impl OrchestratorClient {
    /// Fetch a decrypted credential
    ///
    /// A missing credential surfaces as a 404 `ClientError::ApiError`, see
    /// [`ClientError::is_not_found`](crate::ClientError::is_not_found).
    pub async fn get_credential(
        &self,
        cred_type: CredentialType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential> {
        let url = format!(
            "{}/api/credentials/{}/{}/{}",
            self.base_url,
            account,
            cred_type.as_str(),
            identifier
        );
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Store a credential, replacing any with the same account, type and identifier
    ///
    /// # Returns
    /// The stored credential's id
    pub async fn add_credential(&self, cred: &NewCredential) -> Result<i64> {
        let url = format!("{}/api/credentials", self.base_url);
        let response = self.client.put(&url).json(cred).send().await?;

        let created: CreatedCredential = self.handle_response(response).await?;
        Ok(created.id)
    }

    pub async fn add_ssh_key(&self, path: &str, key: &str) -> Result<()> {
        let url = format!("{}/api/credentials/ssh", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&AddSshKey {
                path: path.to_string(),
                key: key.to_string(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    pub async fn ssh_key_exists(&self, path: &str) -> Result<bool> {
        let url = format!("{}/api/credentials/ssh/exists", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("path", path)])
            .send()
            .await?;

        let exists: SshKeyExists = self.handle_response(response).await?;
        Ok(exists.exists)
    }

    /// Create a short-lived secret token for a build
    pub async fn throwaway_token(&self) -> Result<String> {
        let url = format!("{}/api/credentials/token", self.base_url);
        let response = self.client.post(&url).send().await?;

        let token: ThrowawayToken = self.handle_response(response).await?;
        Ok(token.token)
    }
}
