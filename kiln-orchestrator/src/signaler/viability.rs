//! Viability rules
//!
//! A commit is viable when its branch fully matches one of the configured
//! branch filters and none of its commits asks to be skipped. `force`
//! bypasses both checks.

use kiln_core::domain::commit::{Commit, SKIP_MESSAGES};
use regex::Regex;

use super::{NotViable, SignalError};

/// Whether `branch` fully matches any of `filters`
///
/// An invalid filter is an error even when an earlier filter already matched,
/// so a broken configuration is noticed on the first event.
pub fn branch_matches(branch: &str, filters: &[String]) -> Result<bool, SignalError> {
    let mut matched = false;
    for pattern in filters {
        let re = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            SignalError::BranchFilter {
                pattern: pattern.clone(),
                source,
            }
        })?;
        matched |= re.is_match(branch);
    }
    Ok(matched)
}

/// Returns `Err(SignalError::NotViable)` when the event should not build
pub fn check_viability(
    branch: &str,
    filters: &[String],
    commits: &[Commit],
    force: bool,
) -> Result<(), SignalError> {
    if force {
        return Ok(());
    }

    if !branch_matches(branch, filters)? {
        return Err(NotViable::new(format!(
            "branch {} not in the acceptable branches list: {}",
            branch,
            filters.join(", ")
        ))
        .into());
    }

    if let Some(commit) = commits.iter().find(|c| c.skip_message().is_some()) {
        return Err(NotViable::new(format!(
            "build will not be queued because one of {} was found in the commit with hash {}",
            SKIP_MESSAGES.join(" | "),
            commit.hash
        ))
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn filters(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    fn commit(hash: &str, message: &str) -> Commit {
        Commit {
            hash: hash.to_string(),
            message: message.to_string(),
            author: "dev".to_string(),
            date: Utc::now(),
        }
    }

    #[test]
    fn test_branch_filters_match_whole_name() {
        let f = filters(&["main", "release/.*"]);
        assert!(branch_matches("main", &f).unwrap());
        assert!(branch_matches("release/1.2", &f).unwrap());
        assert!(!branch_matches("not-main", &f).unwrap());
        assert!(!branch_matches("mainline", &f).unwrap());
    }

    #[test]
    fn test_empty_filter_list_is_not_viable() {
        let err = check_viability("main", &[], &[], false).unwrap_err();
        assert!(err.is_not_viable());
    }

    #[test]
    fn test_invalid_pattern_is_hard_error() {
        let err = check_viability("main", &filters(&["main", "feature/("]), &[], false).unwrap_err();
        assert!(matches!(err, SignalError::BranchFilter { ref pattern, .. } if pattern == "feature/("));
    }

    #[test]
    fn test_skip_message_is_not_viable() {
        let commits = vec![commit("aaa", "fix typo"), commit("bbb", "docs [ci skip]")];
        let err = check_viability("main", &filters(&["main"]), &commits, false).unwrap_err();
        match err {
            SignalError::NotViable(nv) => assert!(nv.reason.contains("bbb")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_force_bypasses_checks() {
        let commits = vec![commit("aaa", "[skip ci]")];
        assert!(check_viability("feature/x", &filters(&["main"]), &commits, true).is_ok());
    }
}
