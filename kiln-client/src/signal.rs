//! Signal endpoint

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::dto::signal::{SignalRequest, SignalResponse};

impl OrchestratorClient {
    /// Hand a decoded commit event to the signaler
    ///
    /// # Returns
    /// Whether the build was queued, failed validation, or was not viable
    pub async fn signal(&self, req: &SignalRequest) -> Result<SignalResponse> {
        let url = format!("{}/api/signal", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }

    /// Check that the orchestrator is up
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_empty_response(response).await
    }
}
