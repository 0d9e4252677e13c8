use anyhow::Result;
use async_trait::async_trait;

use crate::domain::stage::StageResult;
use crate::domain::summary::NewBuildSummary;

/// Persistence of build summaries, stage details and output
#[async_trait]
pub trait BuildStorage: Send + Sync {
    /// Creates the summary row and returns the durable build id
    async fn add_sum_start(&self, summary: &NewBuildSummary) -> Result<i64>;

    /// Marks the build as queued
    async fn set_queue_time(&self, build_id: i64) -> Result<()>;

    /// Marks the build as running
    async fn start_build(&self, build_id: i64) -> Result<()>;

    /// Records the terminal outcome of a build that ran its stages
    async fn update_sum(&self, failed: bool, duration: f64, build_id: i64) -> Result<()>;

    /// Marks a queued build as failed before any stage ran
    async fn store_failed_validation(&self, build_id: i64) -> Result<()>;

    async fn add_stage_detail(&self, build_id: i64, result: &StageResult) -> Result<()>;

    /// Appends raw output to the build's log
    async fn add_out(&self, build_id: i64, output: &[u8]) -> Result<()>;

    /// Whether a build for `hash` is currently queued or running
    async fn is_building(&self, hash: &str) -> Result<bool>;
}
