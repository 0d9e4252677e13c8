//! Build task domain types
//!
//! A [`BuildTask`] is the unit of work handed from the signaler to a builder
//! host. It is created once a commit is accepted, is immutable once queued and
//! is consumed by exactly one builder.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::config::BuildConfig;

/// Hosting provider of the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VcsType {
    Bitbucket,
    Github,
}

/// What caused a build to be signaled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignaledBy {
    Push,
    PullRequest,
    Poll,
    Manual,
    Subscribed,
}

/// One scheduled build of a specific commit
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Durable build id, assigned when the summary row is created
    pub id: i64,
    /// `account/repo`
    pub full_name: String,
    pub checkout_hash: String,
    pub branch: String,
    pub vcs_type: VcsType,
    pub build_config: BuildConfig,
    pub signaled_by: SignaledBy,
    /// Token the build host uses to fetch the code
    pub vcs_token: String,
    /// Throwaway token for secret retrieval during the build
    pub vault_token: String,
}

impl BuildTask {
    /// First seven characters of the checkout hash
    pub fn short_hash(&self) -> &str {
        let end = self
            .checkout_hash
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.checkout_hash.len());
        &self.checkout_hash[..end]
    }

    /// Account part of `full_name`
    pub fn account(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(account, _)| account)
            .unwrap_or(&self.full_name)
    }

    /// Machine tag the task must run on, `None` for container builds
    pub fn machine_tag(&self) -> Option<&str> {
        self.build_config.machine_tag.as_deref()
    }

    /// Environment injected into every build container
    pub fn standard_env(&self) -> Vec<String> {
        vec![
            format!("GIT_HASH={}", self.checkout_hash),
            format!("BUILD_ID={}", self.id),
            format!("GIT_HASH_SHORT={}", self.short_hash()),
            format!("GIT_BRANCH={}", self.branch),
        ]
    }
}

// Tokens must never end up in log output.
impl fmt::Debug for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTask")
            .field("id", &self.id)
            .field("full_name", &self.full_name)
            .field("checkout_hash", &self.checkout_hash)
            .field("branch", &self.branch)
            .field("vcs_type", &self.vcs_type)
            .field("build_config", &self.build_config)
            .field("signaled_by", &self.signaled_by)
            .field("vcs_token", &"<redacted>")
            .field("vault_token", &"<redacted>")
            .finish()
    }
}

/// Whether a runner advertising `runner_tags` may take a task tagged `task_tag`
///
/// Untagged runners only take container builds. Tagged runners only take
/// tasks carrying one of their tags.
pub fn runner_accepts(runner_tags: &[String], task_tag: Option<&str>) -> bool {
    match task_tag {
        None => runner_tags.is_empty(),
        Some(tag) => runner_tags.iter().any(|t| t == tag),
    }
}

/// Splits `account/repo` into its parts
pub fn split_full_name(full_name: &str) -> Option<(&str, &str)> {
    let (account, repo) = full_name.split_once('/')?;
    if account.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((account, repo))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> BuildTask {
        BuildTask {
            id: 42,
            full_name: "acme/widgets".to_string(),
            checkout_hash: "abc123def4567890".to_string(),
            branch: "main".to_string(),
            vcs_type: VcsType::Bitbucket,
            build_config: BuildConfig::default(),
            signaled_by: SignaledBy::Push,
            vcs_token: "vcs-secret".to_string(),
            vault_token: "vault-secret".to_string(),
        }
    }

    #[test]
    fn test_machine_tag_routing() {
        let mut t = task();
        assert_eq!(t.machine_tag(), None);
        assert!(runner_accepts(&[], t.machine_tag()));
        assert!(!runner_accepts(&["mac".to_string()], t.machine_tag()));

        t.build_config.machine_tag = Some("mac".to_string());
        assert!(!runner_accepts(&[], t.machine_tag()));
        assert!(!runner_accepts(&["linux".to_string()], t.machine_tag()));
        assert!(runner_accepts(&["linux".to_string(), "mac".to_string()], t.machine_tag()));
    }

    #[test]
    fn test_standard_env() {
        let env = task().standard_env();
        assert_eq!(
            env,
            vec![
                "GIT_HASH=abc123def4567890",
                "BUILD_ID=42",
                "GIT_HASH_SHORT=abc123d",
                "GIT_BRANCH=main",
            ]
        );
    }

    #[test]
    fn test_short_hash_of_short_input() {
        let mut t = task();
        t.checkout_hash = "abc".to_string();
        assert_eq!(t.short_hash(), "abc");
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let debug = format!("{:?}", task());
        assert!(!debug.contains("vcs-secret"));
        assert!(!debug.contains("vault-secret"));
        assert!(debug.contains("acme/widgets"));
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("acme/widgets"), Some(("acme", "widgets")));
        assert_eq!(split_full_name("acme"), None);
        assert_eq!(split_full_name("acme/"), None);
        assert_eq!(split_full_name("a/b/c"), None);
        assert_eq!(task().account(), "acme");
    }
}
