//! Poll-driven change detection
//!
//! For repositories without webhooks a scheduler periodically asks whether a
//! branch moved since the last hash it saw. A moved branch goes through the
//! regular signal path with `SignaledBy::Poll`.

use kiln_core::domain::build::{SignaledBy, VcsType};
use kiln_core::dto::signal::{SignalRequest, SignalResponse};
use kiln_core::interface::VcsHandler;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::{NotViable, Signaler, SignalError, fetch_config};

#[derive(Debug, Error)]
pub enum ChangeError {
    /// The branch has no commits at all; callers may retry later
    #[error("no commits found on {acct_repo} branch {branch}")]
    NoCommits { acct_repo: String, branch: String },

    #[error("vcs request failed: {0:#}")]
    Vcs(anyhow::Error),

    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl ChangeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChangeError::NoCommits { .. })
    }
}

/// Result of one poll of a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Hash to remember for the next poll
    pub last_hash: String,
    pub response: SignalResponse,
}

pub struct ChangeChecker {
    vcs: Arc<dyn VcsHandler>,
    signaler: Arc<Signaler>,
    vcs_type: VcsType,
}

impl ChangeChecker {
    pub fn new(vcs: Arc<dyn VcsHandler>, signaler: Arc<Signaler>, vcs_type: VcsType) -> Self {
        Self {
            vcs,
            signaler,
            vcs_type,
        }
    }

    /// Signals a build when the head of `branch` differs from `last_hash`
    ///
    /// An empty `last_hash` means the branch was never polled, so its current
    /// head is built.
    pub async fn check_branch(
        &self,
        acct_repo: &str,
        branch: &str,
        last_hash: &str,
    ) -> Result<PollOutcome, ChangeError> {
        let commits = self
            .vcs
            .get_all_commits(acct_repo, branch)
            .await
            .map_err(ChangeError::Vcs)?;

        let Some(latest) = commits.into_iter().next() else {
            return Err(ChangeError::NoCommits {
                acct_repo: acct_repo.to_string(),
                branch: branch.to_string(),
            });
        };

        if !last_hash.is_empty() && latest.hash == last_hash {
            let response = self
                .signaler
                .not_viable(NotViable::new("no new commits"), last_hash, acct_repo, branch);
            return Ok(PollOutcome {
                last_hash: last_hash.to_string(),
                response,
            });
        }

        info!(acct_repo, branch, hash = %latest.hash, "new commit found, signaling build");

        let config = fetch_config(self.vcs.as_ref(), acct_repo, &latest.hash)
            .await
            .map_err(ChangeError::Vcs)?;

        let request = SignalRequest {
            full_name: acct_repo.to_string(),
            branch: branch.to_string(),
            hash: latest.hash.clone(),
            vcs_type: self.vcs_type,
            vcs_token: self.vcs.access_token().to_string(),
            signaled_by: SignaledBy::Poll,
            config,
            commits: vec![latest.clone()],
            force: false,
        };
        let response = self.signaler.signal(&request).await?;

        Ok(PollOutcome {
            last_hash: latest.hash,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaler::tests::{CONFIG, FakeVcs, harness};
    use kiln_core::metrics::BUILDS_NOT_VIABLE;

    fn checker(vcs: FakeVcs, signaler: Arc<Signaler>) -> ChangeChecker {
        ChangeChecker::new(Arc::new(vcs), signaler, VcsType::Bitbucket)
    }

    #[tokio::test]
    async fn test_first_poll_builds_head() {
        let h = harness();
        let vcs = FakeVcs::default().with_repo("acme/widgets", &["new", "old"], Some(CONFIG));
        let checker = checker(vcs, h.signaler.clone());

        let outcome = checker.check_branch("acme/widgets", "main", "").await.unwrap();

        assert_eq!(outcome.last_hash, "new");
        assert_eq!(outcome.response, SignalResponse::Queued { build_id: 1 });
        let tasks = h.queue.tasks.lock().unwrap();
        assert_eq!(tasks[0].checkout_hash, "new");
        assert_eq!(tasks[0].signaled_by, SignaledBy::Poll);
    }

    #[tokio::test]
    async fn test_unchanged_branch_is_not_rebuilt() {
        let h = harness();
        let vcs = FakeVcs::default().with_repo("acme/widgets", &["new"], Some(CONFIG));
        let checker = checker(vcs, h.signaler.clone());

        let first = checker.check_branch("acme/widgets", "main", "old").await.unwrap();
        let second = checker
            .check_branch("acme/widgets", "main", &first.last_hash)
            .await
            .unwrap();

        assert_eq!(second.last_hash, "new");
        assert!(matches!(second.response, SignalResponse::NotViable { .. }));
        assert_eq!(h.queue.tasks.lock().unwrap().len(), 1);
        assert_eq!(h.metrics.count(BUILDS_NOT_VIABLE), 1);
    }

    #[tokio::test]
    async fn test_branch_without_commits_is_recoverable() {
        let h = harness();
        let checker = checker(FakeVcs::default(), h.signaler.clone());

        let err = checker.check_branch("acme/empty", "main", "").await.unwrap_err();

        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_repo_without_config_is_not_viable() {
        let h = harness();
        let vcs = FakeVcs::default().with_repo("acme/widgets", &["new"], None);
        let checker = checker(vcs, h.signaler.clone());

        let outcome = checker.check_branch("acme/widgets", "main", "").await.unwrap();

        assert_eq!(outcome.last_hash, "new");
        assert!(matches!(outcome.response, SignalResponse::NotViable { .. }));
    }
}
