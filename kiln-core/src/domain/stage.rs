//! Stage domain types
//!
//! A stage is one named step of a build: an ordered script plus environment
//! assignments. Running a stage produces a [`StageResult`], which is persisted
//! exactly once and never changed afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Appended to messages of stages that completed
pub const CHECKMARK: &str = "\u{2713}";

/// Appended to messages of stages that failed
pub const FAILED_MARK: &str = "\u{2717}";

/// One named unit of work from the build configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub script: Vec<String>,
    /// `KEY=VALUE` assignments
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<StageTrigger>,
}

/// Restricts a stage to a set of branches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>, script: Vec<String>, env: Vec<String>) -> Self {
        Self {
            name: name.into(),
            script,
            env,
            trigger: None,
        }
    }

    /// Returns true when the stage has a trigger list that excludes `branch`.
    ///
    /// A trigger block with no branches does not restrict anything.
    pub fn skipped_for(&self, branch: &str) -> bool {
        match &self.trigger {
            Some(trigger) if !trigger.branches.is_empty() => {
                !trigger.branches.iter().any(|b| b == branch)
            }
            _ => false,
        }
    }
}

/// Outcome status of a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    #[default]
    Nil,
    Pass,
    Fail,
}

/// Recorded outcome of executing one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    /// Empty unless the stage failed
    pub error: String,
    /// Human readable progress, append only
    pub messages: Vec<String>,
    pub start_time: DateTime<Utc>,
    /// Seconds
    pub duration: f64,
}

impl StageResult {
    /// Creates a passing result starting now
    pub fn pass(stage: impl Into<String>, messages: Vec<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pass,
            error: String::new(),
            messages,
            start_time: Utc::now(),
            duration: 0.0,
        }
    }

    /// Creates a failing result starting now
    ///
    /// An empty `error` is replaced with a generic one so that a failed
    /// result always carries error text.
    pub fn fail(
        stage: impl Into<String>,
        error: impl Into<String>,
        messages: Vec<String>,
    ) -> Self {
        let stage = stage.into();
        let mut error = error.into();
        if error.is_empty() {
            error = format!("{} stage failed", stage);
        }
        Self {
            stage,
            status: StageStatus::Fail,
            error,
            messages,
            start_time: Utc::now(),
            duration: 0.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Fail
    }

    /// Stamps the start time and computes the duration up to now
    pub fn timed_from(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.duration = (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0;
        self
    }

    /// Puts `prior` in front of the result's own messages
    pub fn with_prior_messages(mut self, prior: &[String]) -> Self {
        let mut messages = prior.to_vec();
        messages.append(&mut self.messages);
        self.messages = messages;
        self
    }
}

/// Stage name plus the prefix stamped on every log line it produces
///
/// `setup` is labelled `SETUP | `, and a substage `ssh key` of
/// `integration_util` becomes `integration_util | ssh key` labelled
/// `INTEGRATION_UTIL | SSH KEY | `.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLabel {
    stage: String,
    label: String,
}

impl StageLabel {
    pub fn new(name: &str) -> Self {
        Self {
            stage: name.to_lowercase(),
            label: format!("{} | ", name.to_uppercase()),
        }
    }

    pub fn substage(&self, name: &str) -> Self {
        Self {
            stage: format!("{} | {}", self.stage, name.to_lowercase()),
            label: format!("{}{} | ", self.label, name.to_uppercase()),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
