//! Commit domain type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages that keep a commit from being built
pub const SKIP_MESSAGES: [&str; 2] = ["[skip ci]", "[ci skip]"];

/// A commit as reported by a VCS handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub date: DateTime<Utc>,
}

impl Commit {
    /// Returns the first skip message contained in the commit message
    pub fn skip_message(&self) -> Option<&'static str> {
        SKIP_MESSAGES
            .iter()
            .copied()
            .find(|skip| self.message.contains(skip))
    }
}
