//! Signaler
//!
//! Decides whether an inbound commit becomes a build and, if so, persists
//! and dispatches it:
//!
//! 1. no build configuration, a branch outside the filters, a skip message
//!    or a hash that is already building make the event NotViable
//! 2. otherwise a summary row is created and the build is marked queued
//! 3. a configuration that fails validation is recorded as FAILED_PRESTART
//!    and never dispatched
//! 4. a valid one gets a throwaway secret token and goes onto the queue
//!
//! NotViable is a soft outcome. Anything failing after the summary row exists
//! is a hard error.

pub mod poll;
pub mod subscription;
pub mod viability;

use chrono::Utc;
use kiln_core::domain::build::{BuildTask, split_full_name};
use kiln_core::domain::config::BuildConfig;
use kiln_core::domain::credential::{CredentialType, vcs_identifier};
use kiln_core::domain::stage::{CHECKMARK, StageResult};
use kiln_core::domain::summary::NewBuildSummary;
use kiln_core::dto::signal::{SignalRequest, SignalResponse};
use kiln_core::error::{ConfigError, CredentialError, VcsError};
use kiln_core::interface::{BuildQueue, BuildStorage, CredentialStore, VcsHandler};
use kiln_core::metrics::{BUILDS_FAILED, BUILDS_NOT_VIABLE, BUILDS_QUEUED, MetricsSink};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use viability::check_viability;

/// Stage name of the result stored when an event is accepted
pub const VALIDATION_STAGE: &str = "hookhandler validation";

/// The event does not warrant a build
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct NotViable {
    pub reason: String,
}

impl NotViable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error(transparent)]
    NotViable(#[from] NotViable),

    #[error("invalid branch filter `{pattern}`: {source}")]
    BranchFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0:?} is not an account/repo name")]
    FullName(String),

    #[error("unable to retrieve vcs credential: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl SignalError {
    pub fn is_not_viable(&self) -> bool {
        matches!(self, SignalError::NotViable(_))
    }
}

pub struct Signaler {
    storage: Arc<dyn BuildStorage>,
    queue: Arc<dyn BuildQueue>,
    creds: Arc<dyn CredentialStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl Signaler {
    pub fn new(
        storage: Arc<dyn BuildStorage>,
        queue: Arc<dyn BuildQueue>,
        creds: Arc<dyn CredentialStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            storage,
            queue,
            creds,
            metrics,
        }
    }

    /// Handles one decoded commit event
    pub async fn signal(&self, req: &SignalRequest) -> Result<SignalResponse, SignalError> {
        let outcome = match req.config.as_deref() {
            None => Err(NotViable::new("no build configuration found").into()),
            Some(raw) => match BuildConfig::from_yaml(raw) {
                Ok(config) => self.check_viable_then_queue_and_store(req, config).await,
                Err(e) => Err(e.into()),
            },
        };

        match outcome {
            Err(SignalError::NotViable(nv)) => Ok(self.not_viable(nv, &req.hash, &req.full_name, &req.branch)),
            other => other,
        }
    }

    /// Records an event that does not warrant a build
    pub(crate) fn not_viable(&self, nv: NotViable, hash: &str, full_name: &str, branch: &str) -> SignalResponse {
        info!(hash, repo = full_name, branch,
            "not queuing, this is fine, just doesn't fit requirements: {}", nv);
        self.metrics.inc(BUILDS_NOT_VIABLE, &[]);
        SignalResponse::NotViable { reason: nv.reason }
    }

    async fn check_viable_then_queue_and_store(
        &self,
        req: &SignalRequest,
        config: BuildConfig,
    ) -> Result<SignalResponse, SignalError> {
        check_viability(&req.branch, &config.branches, &req.commits, req.force)?;
        self.queue_and_store(req, config).await
    }

    async fn queue_and_store(
        &self,
        req: &SignalRequest,
        config: BuildConfig,
    ) -> Result<SignalResponse, SignalError> {
        let (account, repo) =
            split_full_name(&req.full_name).ok_or_else(|| SignalError::FullName(req.full_name.clone()))?;

        if self.storage.is_building(&req.hash).await? {
            return Err(NotViable::new("this hash is already building, therefore not adding to queue").into());
        }

        let vcs_cred = self
            .creds
            .get_cred(CredentialType::Vcs, &vcs_identifier(req.vcs_type, account), account)
            .await?;

        let build_id = self
            .storage
            .add_sum_start(&NewBuildSummary {
                hash: req.hash.clone(),
                account: account.to_string(),
                repo: repo.to_string(),
                branch: req.branch.clone(),
                signaled_by: req.signaled_by,
                credential_id: vcs_cred.id,
            })
            .await?;
        let start = Utc::now();
        self.storage.set_queue_time(build_id).await?;

        if let Err(e) = config.validate() {
            let reason = e.to_string();
            warn!(build_id, hash = %req.hash, "build configuration failed validation: {}", reason);
            let result = StageResult::fail(
                VALIDATION_STAGE,
                reason.clone(),
                vec!["Failed initial validation".to_string()],
            )
            .timed_from(start);
            self.storage.store_failed_validation(build_id).await?;
            self.storage.add_stage_detail(build_id, &result).await?;
            self.metrics.inc(BUILDS_FAILED, &["validation"]);
            return Ok(SignalResponse::FailedValidation { build_id, reason });
        }

        let vault_token = match self.creds.create_throwaway_token().await {
            Ok(token) => token,
            Err(e) => {
                self.abandon(build_id).await;
                return Err(e.context("Failed to create throwaway token").into());
            }
        };

        let result = StageResult::pass(
            VALIDATION_STAGE,
            vec![format!("Passed initial validation {}", CHECKMARK)],
        )
        .timed_from(start);
        self.storage.add_stage_detail(build_id, &result).await?;

        let task = BuildTask {
            id: build_id,
            full_name: req.full_name.clone(),
            checkout_hash: req.hash.clone(),
            branch: req.branch.clone(),
            vcs_type: req.vcs_type,
            build_config: config,
            signaled_by: req.signaled_by,
            vcs_token: req.vcs_token.clone(),
            vault_token,
        };

        if let Err(e) = self.queue.enqueue(&task).await {
            self.abandon(build_id).await;
            return Err(e.context("Failed to enqueue build task").into());
        }

        self.metrics.inc(BUILDS_QUEUED, &[]);
        info!(build_id, hash = %req.hash, repo = %req.full_name, branch = %req.branch, "build queued");
        Ok(SignalResponse::Queued { build_id })
    }

    /// Marks a queued build that could not be dispatched as failed
    async fn abandon(&self, build_id: i64) {
        if let Err(e) = self.storage.store_failed_validation(build_id).await {
            error!(build_id, "unable to update summary of undispatched build: {:#}", e);
        }
    }
}

/// Raw build configuration at `hash`; `None` when the repository has none
pub(crate) async fn fetch_config(
    vcs: &dyn VcsHandler,
    acct_repo: &str,
    hash: &str,
) -> anyhow::Result<Option<String>> {
    match vcs.get_build_config(acct_repo, hash).await {
        Ok(raw) => Ok(Some(raw)),
        Err(VcsError::FileNotFound(path)) => {
            debug!(hash, "no build configuration at {}", path);
            Ok(None)
        }
        Err(VcsError::Other(e)) => Err(e),
    }
}
