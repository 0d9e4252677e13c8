//! Stage runner
//!
//! Drives one claimed build through its builder: setup, the integration
//! stage, then every configured stage in file order. Each result is persisted
//! as soon as it lands and the first failure stops the build.
//!
//! Status bookkeeping: the summary stays QUEUED during setup. A failed setup
//! marks it FAILED_PRESTART; otherwise it moves to RUNNING and ends PASSED or
//! FAILED.

use anyhow::{Context, Result};
use chrono::Utc;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::stage::StageResult;
use kiln_core::interface::{BuildStorage, CredentialStore};
use kiln_core::metrics::{
    BUILDS_FAILED, BUILDS_STARTED, MetricsSink, SETUP_DURATION_SECONDS, STAGE_DURATION_SECONDS,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::Builder;
use crate::cleaner::{Cleaner, watch_substrate};
use crate::integrations::{Integration, run_integrations};
use crate::logstream::LogSink;

/// How a build ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    SetupFailed,
    Passed,
    Failed,
}

pub struct Launcher {
    storage: Arc<dyn BuildStorage>,
    creds: Arc<dyn CredentialStore>,
    cleaner: Arc<dyn Cleaner>,
    metrics: Arc<dyn MetricsSink>,
    integrations: Vec<Box<dyn Integration>>,
    host_port: String,
}

impl Launcher {
    pub fn new(
        storage: Arc<dyn BuildStorage>,
        creds: Arc<dyn CredentialStore>,
        cleaner: Arc<dyn Cleaner>,
        metrics: Arc<dyn MetricsSink>,
        integrations: Vec<Box<dyn Integration>>,
        host_port: String,
    ) -> Self {
        Self {
            storage,
            creds,
            cleaner,
            metrics,
            integrations,
            host_port,
        }
    }

    /// Runs `task` on `builder` and releases the substrate afterwards
    ///
    /// `cancel` is the build's own token. It is cancelled on return, which
    /// triggers substrate cleanup.
    pub async fn run_build(
        &self,
        task: &BuildTask,
        builder: &mut dyn Builder,
        cancel: &CancellationToken,
        logs: &LogSink,
    ) -> Result<BuildOutcome> {
        let (id_tx, id_rx) = oneshot::channel();
        let watcher = watch_substrate(id_rx, cancel.clone(), Arc::clone(&self.cleaner), logs.clone());

        let outcome = self.drive(task, builder, cancel, logs, id_tx).await;

        cancel.cancel();
        if let Err(e) = watcher.await {
            warn!(build_id = task.id, "cleanup task failed: {}", e);
        }
        if let Err(e) = builder.teardown().await {
            warn!(build_id = task.id, "teardown failed: {:#}", e);
        }

        outcome
    }

    async fn drive(
        &self,
        task: &BuildTask,
        builder: &mut dyn Builder,
        cancel: &CancellationToken,
        logs: &LogSink,
        id_tx: oneshot::Sender<String>,
    ) -> Result<BuildOutcome> {
        debug!(build_id = task.id, hash = %task.checkout_hash, "starting setup");

        let setup_start = Utc::now();
        let (setup, substrate_id) = builder
            .setup(cancel, logs, id_tx, task, self.creds.as_ref(), &self.host_port)
            .await;
        let setup = setup.timed_from(setup_start);
        self.metrics
            .observe(SETUP_DURATION_SECONDS, setup.duration, &[]);
        self.store(task.id, &setup).await?;

        if setup.is_failed() {
            error!(build_id = task.id, hash = %task.checkout_hash, "setup failed: {}", setup.error);
            self.storage
                .store_failed_validation(task.id)
                .await
                .context("Failed to mark build as failed before start")?;
            self.metrics.inc(BUILDS_FAILED, &["setup"]);
            return Ok(BuildOutcome::SetupFailed);
        }
        debug!(build_id = task.id, "setup finished on substrate {:?}", substrate_id);

        self.storage
            .start_build(task.id)
            .await
            .context("Failed to mark build as running")?;
        self.metrics.inc(BUILDS_STARTED, &[]);
        let build_start = Utc::now();

        let integration_start = Utc::now();
        let integration = run_integrations(
            cancel,
            &*builder,
            task,
            self.creds.as_ref(),
            &self.integrations,
            logs,
        )
        .await
        .timed_from(integration_start);
        self.store(task.id, &integration).await?;

        let mut failed = integration.is_failed();
        if !failed {
            failed = self.run_stages(task, &*builder, cancel, logs).await?;
        }

        let duration = (Utc::now() - build_start).num_milliseconds().max(0) as f64 / 1000.0;
        self.storage
            .update_sum(failed, duration, task.id)
            .await
            .context("Failed to update build summary")?;

        if failed {
            self.metrics.inc(BUILDS_FAILED, &["stage"]);
            info!(build_id = task.id, hash = %task.checkout_hash, "build failed");
            Ok(BuildOutcome::Failed)
        } else {
            info!(build_id = task.id, hash = %task.checkout_hash, "build passed");
            Ok(BuildOutcome::Passed)
        }
    }

    /// Runs the configured stages; returns whether one failed
    async fn run_stages(
        &self,
        task: &BuildTask,
        builder: &dyn Builder,
        cancel: &CancellationToken,
        logs: &LogSink,
    ) -> Result<bool> {
        for stage in &task.build_config.stages {
            if stage.skipped_for(&task.branch) {
                let skipped = StageResult::pass(
                    &stage.name,
                    vec![format!(
                        "skipping stage because {} is not in the trigger branches list",
                        task.branch
                    )],
                );
                self.store(task.id, &skipped).await?;
                continue;
            }

            let stage_start = Utc::now();
            let result = builder
                .execute(cancel, stage, logs, &task.checkout_hash)
                .await
                .timed_from(stage_start);
            info!(build_id = task.id, hash = %task.checkout_hash, stage = %stage.name, "finished stage");
            self.metrics
                .observe(STAGE_DURATION_SECONDS, result.duration, &[&stage.name]);
            self.store(task.id, &result).await?;

            if result.is_failed() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn store(&self, build_id: i64, result: &StageResult) -> Result<()> {
        self.storage
            .add_stage_detail(build_id, result)
            .await
            .with_context(|| format!("Failed to store result of stage {}", result.stage))
    }
}
