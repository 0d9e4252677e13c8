//! Subscription endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::summary::ActiveSubscription;
use kiln_core::dto::subscription::NewSubscription;

impl OrchestratorClient {
    /// Subscribe a downstream branch to an upstream one
    pub async fn add_subscription(&self, sub: &NewSubscription) -> Result<ActiveSubscription> {
        let url = format!("{}/api/subscriptions", self.base_url);
        let response = self.client.post(&url).json(sub).send().await?;

        self.handle_response(response).await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<ActiveSubscription>> {
        let url = format!("{}/api/subscriptions", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
