use anyhow::Result;
use async_trait::async_trait;

use crate::domain::build::BuildTask;

/// Outbound queue that builder hosts pull tasks from
#[async_trait]
pub trait BuildQueue: Send + Sync {
    async fn enqueue(&self, task: &BuildTask) -> Result<()>;
}
