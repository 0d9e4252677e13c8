//! Build summary domain types
//!
//! The summary row is the persisted view of a build's lifecycle:
//!
//! ```text
//! NIL -> QUEUED -> RUNNING -> PASSED | FAILED
//!           \
//!            -> FAILED_PRESTART
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::build::SignaledBy;

/// Persisted status of a build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    /// Row created, not yet queued
    #[default]
    Nil,
    Queued,
    Running,
    Passed,
    Failed,
    /// Validation or setup failed before any stage ran
    FailedPrestart,
}

impl BuildStatus {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Nil, Queued)
                | (Queued, Running)
                | (Queued, FailedPrestart)
                | (Running, Passed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Passed | BuildStatus::Failed | BuildStatus::FailedPrestart
        )
    }

    /// Queued or running
    pub fn is_active(self) -> bool {
        matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }
}

/// Persisted summary of one build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub id: i64,
    pub hash: String,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub signaled_by: SignaledBy,
    pub credential_id: i64,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub queue_time: Option<DateTime<Utc>>,
    pub build_time: Option<DateTime<Utc>>,
    /// Seconds
    pub build_duration: Option<f64>,
}

/// Values needed to create a summary row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuildSummary {
    pub hash: String,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub signaled_by: SignaledBy,
    pub credential_id: i64,
}

/// A downstream repo that wants a build whenever an upstream branch passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    pub id: i64,
    /// Upstream `account/repo`
    pub subscribed_to: String,
    pub subscribed_branch: String,
    /// Downstream `account/repo`
    pub subscriber: String,
    pub subscriber_branch: String,
    pub vcs_type: crate::domain::build::VcsType,
}

/// Upstream build that caused a subscription build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBuilderEvent {
    pub upstream_build_id: i64,
    pub upstream_full_name: String,
    pub upstream_branch: String,
    pub upstream_hash: String,
}
