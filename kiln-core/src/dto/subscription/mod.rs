//! Subscription DTOs

use serde::{Deserialize, Serialize};

use crate::domain::build::VcsType;

/// Makes `subscriber` build whenever `subscribed_to` passes on a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscription {
    /// Upstream `account/repo`
    pub subscribed_to: String,
    pub subscribed_branch: String,
    /// Downstream `account/repo`
    pub subscriber: String,
    pub subscriber_branch: String,
    pub vcs_type: VcsType,
}
