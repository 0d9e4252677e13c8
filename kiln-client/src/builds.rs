//! Build lifecycle endpoints
//!
//! Used by runners to claim queued tasks and report progress, and by anyone
//! querying build status.

use crate::OrchestratorClient;
use crate::error::Result;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::stage::StageResult;
use kiln_core::domain::summary::{BuildSummary, NewBuildSummary};
use kiln_core::dto::build::{BuildActivity, BuildDetails, ClaimBuild, CreatedBuild, FinishBuild};

impl OrchestratorClient {
    // =============================================================================
    // Dispatch
    // =============================================================================

    /// Claim the oldest queued build task this runner can run
    ///
    /// # Arguments
    /// * `runner_id` - The ID of the runner claiming the task
    /// * `machine_tags` - Machine tags the runner serves, empty for container runners
    ///
    /// # Returns
    /// The task, or `None` when nothing claimable is queued
    pub async fn claim_build(&self, runner_id: &str, machine_tags: &[String]) -> Result<Option<BuildTask>> {
        let url = format!("{}/api/queue/claim", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ClaimBuild {
                runner_id: runner_id.to_string(),
                machine_tags: machine_tags.to_vec(),
            })
            .send()
            .await?;

        self.handle_optional_response(response).await
    }

    // =============================================================================
    // Summary Lifecycle
    // =============================================================================

    /// Create a summary row and return its build id
    pub async fn create_summary(&self, summary: &NewBuildSummary) -> Result<i64> {
        let url = format!("{}/api/builds", self.base_url);
        let response = self.client.post(&url).json(summary).send().await?;

        let created: CreatedBuild = self.handle_response(response).await?;
        Ok(created.build_id)
    }

    pub async fn set_queue_time(&self, build_id: i64) -> Result<()> {
        let url = format!("{}/api/builds/{}/queued", self.base_url, build_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Mark a build as running
    pub async fn start_build(&self, build_id: i64) -> Result<()> {
        let url = format!("{}/api/builds/{}/start", self.base_url, build_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Record the terminal outcome of a build
    ///
    /// # Arguments
    /// * `build_id` - The build that finished
    /// * `failed` - Whether any stage failed
    /// * `duration` - Seconds spent running stages
    pub async fn finish_build(&self, build_id: i64, failed: bool, duration: f64) -> Result<()> {
        let url = format!("{}/api/builds/{}/finish", self.base_url, build_id);
        let response = self
            .client
            .post(&url)
            .json(&FinishBuild { failed, duration })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Mark a queued build as failed before any stage ran
    pub async fn fail_prestart(&self, build_id: i64) -> Result<()> {
        let url = format!("{}/api/builds/{}/prestart-failed", self.base_url, build_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Check whether a hash is queued or running
    pub async fn is_building(&self, hash: &str) -> Result<bool> {
        let url = format!("{}/api/builds/active", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("hash", hash)])
            .send()
            .await?;

        let activity: BuildActivity = self.handle_response(response).await?;
        Ok(activity.building)
    }

    // =============================================================================
    // Stage Details & Output
    // =============================================================================

    /// Persist one stage result
    pub async fn add_stage_detail(&self, build_id: i64, result: &StageResult) -> Result<()> {
        let url = format!("{}/api/builds/{}/stages", self.base_url, build_id);
        let response = self.client.post(&url).json(result).send().await?;

        self.handle_empty_response(response).await
    }

    /// Append raw output to a build's log
    pub async fn add_output(&self, build_id: i64, output: &[u8]) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }

        let url = format!("{}/api/builds/{}/output", self.base_url, build_id);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(output.to_vec())
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Queries
    // =============================================================================

    pub async fn list_builds(&self) -> Result<Vec<BuildSummary>> {
        let url = format!("{}/api/builds", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get a build summary with its stage results
    pub async fn get_build(&self, build_id: i64) -> Result<BuildDetails> {
        let url = format!("{}/api/builds/{}", self.base_url, build_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the stage results recorded for a build, in the order they landed
    pub async fn get_stages(&self, build_id: i64) -> Result<Vec<StageResult>> {
        let url = format!("{}/api/builds/{}/stages", self.base_url, build_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the full output of a build
    pub async fn get_output(&self, build_id: i64) -> Result<Vec<u8>> {
        let url = format!("{}/api/builds/{}/output", self.base_url, build_id);
        let response = self.client.get(&url).send().await?;

        let response = self.check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
