//! Build storage over HTTP

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_client::OrchestratorClient;
use kiln_core::domain::stage::StageResult;
use kiln_core::domain::summary::NewBuildSummary;
use kiln_core::interface::BuildStorage;
use std::sync::Arc;

/// [`BuildStorage`] backed by the orchestrator API
pub struct HttpBuildStorage {
    client: Arc<OrchestratorClient>,
}

impl HttpBuildStorage {
    pub fn new(client: Arc<OrchestratorClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BuildStorage for HttpBuildStorage {
    async fn add_sum_start(&self, summary: &NewBuildSummary) -> Result<i64> {
        self.client
            .create_summary(summary)
            .await
            .context("Failed to create build summary")
    }

    async fn set_queue_time(&self, build_id: i64) -> Result<()> {
        self.client
            .set_queue_time(build_id)
            .await
            .with_context(|| format!("Failed to set queue time of build {}", build_id))
    }

    async fn start_build(&self, build_id: i64) -> Result<()> {
        self.client
            .start_build(build_id)
            .await
            .with_context(|| format!("Failed to start build {}", build_id))
    }

    async fn update_sum(&self, failed: bool, duration: f64, build_id: i64) -> Result<()> {
        self.client
            .finish_build(build_id, failed, duration)
            .await
            .with_context(|| format!("Failed to finish build {}", build_id))
    }

    async fn store_failed_validation(&self, build_id: i64) -> Result<()> {
        self.client
            .fail_prestart(build_id)
            .await
            .with_context(|| format!("Failed to mark build {} as failed", build_id))
    }

    async fn add_stage_detail(&self, build_id: i64, result: &StageResult) -> Result<()> {
        self.client
            .add_stage_detail(build_id, result)
            .await
            .with_context(|| format!("Failed to store stage {} of build {}", result.stage, build_id))
    }

    async fn add_out(&self, build_id: i64, output: &[u8]) -> Result<()> {
        self.client
            .add_output(build_id, output)
            .await
            .with_context(|| format!("Failed to send output of build {}", build_id))
    }

    async fn is_building(&self, hash: &str) -> Result<bool> {
        self.client
            .is_building(hash)
            .await
            .context("Failed to check build activity")
    }
}
