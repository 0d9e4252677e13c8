//! Build DTOs

use serde::{Deserialize, Serialize};

use crate::domain::stage::StageResult;
use crate::domain::summary::BuildSummary;

/// Runner asking for the next queued task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimBuild {
    pub runner_id: String,
    /// Machine tags the runner serves; empty for container runners
    #[serde(default)]
    pub machine_tags: Vec<String>,
}

/// Terminal outcome of a build that ran its stages
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FinishBuild {
    pub failed: bool,
    /// Seconds
    pub duration: f64,
}

/// Answer to "is this hash building"
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BuildActivity {
    pub building: bool,
}

/// Summary plus every stage recorded so far
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDetails {
    pub summary: BuildSummary,
    pub stages: Vec<StageResult>,
}

/// Returned when a summary row is created
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreatedBuild {
    pub build_id: i64,
}
