//! Postgres-backed implementations of the kiln-core storage traits
//!
//! The signaler only knows the traits; these adapters route them through the
//! service layer so that the same status rules apply as for the HTTP API.

use anyhow::Result;
use async_trait::async_trait;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::domain::stage::StageResult;
use kiln_core::domain::summary::{ActiveSubscription, NewBuildSummary, TaskBuilderEvent};
use kiln_core::error::CredentialError;
use kiln_core::interface::{BuildQueue, BuildStorage, CredentialStore};
use sqlx::PgPool;

use crate::repository::subscription_repository;
use crate::service::build_service;
use crate::service::credential_service::{self, CredentialServiceError};
use crate::signaler::subscription::SubscriptionStore;

pub struct PgBuildStorage {
    pool: PgPool,
}

impl PgBuildStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStorage for PgBuildStorage {
    async fn add_sum_start(&self, summary: &NewBuildSummary) -> Result<i64> {
        Ok(build_service::create_summary(&self.pool, summary).await?)
    }

    async fn set_queue_time(&self, build_id: i64) -> Result<()> {
        Ok(build_service::set_queued(&self.pool, build_id).await?)
    }

    async fn start_build(&self, build_id: i64) -> Result<()> {
        Ok(build_service::start_build(&self.pool, build_id).await?)
    }

    async fn update_sum(&self, failed: bool, duration: f64, build_id: i64) -> Result<()> {
        build_service::finish_build(&self.pool, build_id, failed, duration).await?;
        Ok(())
    }

    async fn store_failed_validation(&self, build_id: i64) -> Result<()> {
        Ok(build_service::fail_prestart(&self.pool, build_id).await?)
    }

    async fn add_stage_detail(&self, build_id: i64, result: &StageResult) -> Result<()> {
        Ok(build_service::add_stage(&self.pool, build_id, result).await?)
    }

    async fn add_out(&self, build_id: i64, output: &[u8]) -> Result<()> {
        Ok(build_service::add_output(&self.pool, build_id, output).await?)
    }

    async fn is_building(&self, hash: &str) -> Result<bool> {
        Ok(build_service::is_building(&self.pool, hash).await?)
    }
}

pub struct PgBuildQueue {
    pool: PgPool,
}

impl PgBuildQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildQueue for PgBuildQueue {
    async fn enqueue(&self, task: &BuildTask) -> Result<()> {
        Ok(build_service::enqueue(&self.pool, task).await?)
    }
}

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get_cred(
        &self,
        cred_type: CredentialType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential, CredentialError> {
        credential_service::get_credential(&self.pool, cred_type, identifier, account)
            .await
            .map_err(|e| match e {
                CredentialServiceError::NotFound(key) => CredentialError::NotFound(key),
                other => CredentialError::Other(other.into()),
            })
    }

    async fn add_ssh_key(&self, path: &str, key: &str) -> Result<()> {
        Ok(credential_service::add_ssh_key(&self.pool, path, key).await?)
    }

    async fn check_ssh_key_exists(&self, path: &str) -> Result<bool> {
        Ok(credential_service::ssh_key_exists(&self.pool, path).await?)
    }

    async fn create_throwaway_token(&self) -> Result<String> {
        Ok(credential_service::create_throwaway_token())
    }
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_upstream(&self, full_name: &str, branch: &str) -> Result<Vec<ActiveSubscription>> {
        Ok(subscription_repository::find_by_upstream(&self.pool, full_name, branch).await?)
    }

    async fn record_build(&self, subscription_id: i64, event: &TaskBuilderEvent, build_id: i64) -> Result<()> {
        Ok(subscription_repository::record_build(&self.pool, subscription_id, event.upstream_build_id, build_id).await?)
    }
}
