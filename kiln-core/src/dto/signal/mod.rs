//! Signal DTOs
//!
//! A decoded VCS event (push, pull request, manual trigger) handed to the
//! signaler, and the signaler's answer.

use serde::{Deserialize, Serialize};

use crate::domain::build::{SignaledBy, VcsType};
use crate::domain::commit::Commit;

/// A commit event asking for a build
#[derive(Clone, Serialize, Deserialize)]
pub struct SignalRequest {
    /// `account/repo`
    pub full_name: String,
    pub branch: String,
    pub hash: String,
    pub vcs_type: VcsType,
    pub vcs_token: String,
    pub signaled_by: SignaledBy,
    /// Raw YAML build configuration; `None` when the repo has none
    pub config: Option<String>,
    /// Commits included in the event, checked for skip messages
    #[serde(default)]
    pub commits: Vec<Commit>,
    /// Bypasses the viability checks
    #[serde(default)]
    pub force: bool,
}

/// What the signaler did with an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalResponse {
    Queued { build_id: i64 },
    /// Stored, but the configuration failed validation
    FailedValidation { build_id: i64, reason: String },
    NotViable { reason: String },
}
