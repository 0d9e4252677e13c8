//! Build poller
//!
//! Claims queued builds from the orchestrator while permits are available
//! and runs each one in its own task with its own cancellation token, log
//! channel, output consumer and builder.

use anyhow::{Context, Result};
use kiln_client::OrchestratorClient;
use kiln_core::domain::build::BuildTask;
use kiln_core::interface::BuildStorage;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::output::forward_output;
use crate::builder::BuilderFactory;
use crate::config::Config;
use crate::launcher::{BuildOutcome, Launcher};
use crate::logstream::{self, LogSink, send_line};

/// Continuously claims and runs builds
pub struct BuildPoller {
    config: Config,
    client: Arc<OrchestratorClient>,
    storage: Arc<dyn BuildStorage>,
    factory: Arc<BuilderFactory>,
    launcher: Arc<Launcher>,
    semaphore: Arc<Semaphore>,
}

impl BuildPoller {
    pub fn new(
        config: Config,
        client: Arc<OrchestratorClient>,
        storage: Arc<dyn BuildStorage>,
        factory: Arc<BuilderFactory>,
        launcher: Arc<Launcher>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_builds));
        Self {
            config,
            client,
            storage,
            factory,
            launcher,
            semaphore,
        }
    }

    /// Polls until `shutdown` fires, then waits for running builds
    ///
    /// Every build token is a child of `shutdown`, so running builds are
    /// cancelled and their substrates cleaned up on the way out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting build poller (interval: {:?}, builder: {})",
            self.config.poll_interval,
            self.factory.kind()
        );

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            debug!("Polling for queued builds");

            match self.poll_once(&shutdown).await {
                Ok(claimed) if claimed > 0 => info!("Claimed {} build(s) this cycle", claimed),
                Ok(_) => {}
                Err(e) => error!("Error during poll cycle: {:#}", e),
            }
        }

        info!("Shutting down, waiting for running builds");
        let permits = u32::try_from(self.config.max_parallel_builds).unwrap_or(u32::MAX);
        let _all = self
            .semaphore
            .acquire_many(permits)
            .await
            .context("Build semaphore closed")?;
        Ok(())
    }

    /// Claims builds until the queue is empty or no permit is left
    async fn poll_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        let mut claimed = 0;

        while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            let task = self
                .client
                .claim_build(&self.config.runner_id, &self.config.machine_tags)
                .await
                .context("Failed to claim build")?;

            let Some(task) = task else {
                debug!("No builds queued");
                break;
            };

            claimed += 1;
            self.spawn_build(task, shutdown.child_token(), permit);
        }

        Ok(claimed)
    }

    fn spawn_build(&self, task: BuildTask, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let storage = Arc::clone(&self.storage);
        let factory = Arc::clone(&self.factory);
        let launcher = Arc::clone(&self.launcher);
        let timeout = self.config.build_timeout;
        let flush_every = self.config.log_send_interval;

        tokio::spawn(async move {
            let build_id = task.id;
            info!(build_id, hash = %task.checkout_hash, repo = %task.full_name, "Starting build");

            let (logs, rx) = logstream::channel();
            let consumer = tokio::spawn(forward_output(build_id, rx, storage, flush_every));
            let timer = spawn_timeout(token.clone(), timeout, logs.clone());

            let mut builder = factory.create();
            match launcher.run_build(&task, builder.as_mut(), &token, &logs).await {
                Ok(BuildOutcome::Passed) => info!(build_id, "Build passed"),
                Ok(outcome) => info!(build_id, "Build finished: {:?}", outcome),
                Err(e) => error!(build_id, "Build failed to run: {:#}", e),
            }
            drop(builder);

            if let Err(e) = timer.await {
                warn!(build_id, "Timeout task failed: {}", e);
            }
            drop(logs);
            if let Err(e) = consumer.await {
                warn!(build_id, "Output consumer failed: {}", e);
            }

            drop(permit);
        });
    }
}

/// Cancels `token` once `timeout` elapses; ends early when the build does
fn spawn_timeout(token: CancellationToken, timeout: Duration, logs: LogSink) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = time::sleep(timeout) => {
                warn!("Build exceeded {:?}, cancelling", timeout);
                send_line(&logs, "", &format!("build timed out after {}s", timeout.as_secs()));
                token.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_cancels_build() {
        let token = CancellationToken::new();
        let (logs, mut rx) = logstream::channel();

        spawn_timeout(token.clone(), Duration::from_millis(10), logs)
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), b"build timed out after 0s");
    }

    #[tokio::test]
    async fn test_timeout_ends_with_build() {
        let token = CancellationToken::new();
        let (logs, mut rx) = logstream::channel();

        let timer = spawn_timeout(token.clone(), Duration::from_secs(3600), logs);
        token.cancel();
        timer.await.unwrap();

        assert!(rx.recv().await.is_none());
    }
}
