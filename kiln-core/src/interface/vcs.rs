use anyhow::Result;
use async_trait::async_trait;

use crate::domain::commit::Commit;
use crate::error::VcsError;

/// Name of the build configuration file at the repository root
pub const BUILD_CONFIG_FILE: &str = "kiln.yml";

/// Read access to a VCS provider
#[async_trait]
pub trait VcsHandler: Send + Sync {
    /// Commits on `branch`, newest first
    async fn get_all_commits(&self, acct_repo: &str, branch: &str) -> Result<Vec<Commit>>;

    async fn get_branch_last_commit_data(&self, acct_repo: &str, branch: &str) -> Result<Commit>;

    /// Raw build configuration at `hash`; a missing file is `VcsError::FileNotFound`
    async fn get_build_config(&self, acct_repo: &str, hash: &str) -> Result<String, VcsError>;

    /// Token a build host uses to clone the repository
    fn access_token(&self) -> &str;
}
