//! Build Service
//!
//! Business logic for build summaries: the status lifecycle, stage results,
//! output and the dispatch queue.

use kiln_core::domain::build::{BuildTask, runner_accepts};
use kiln_core::domain::stage::StageResult;
use kiln_core::domain::summary::{BuildStatus, BuildSummary, NewBuildSummary};
use kiln_core::dto::build::BuildDetails;
use sqlx::PgPool;
use std::fmt;

use crate::repository::{build_repository, queue_repository};

/// Service error type
#[derive(Debug)]
pub enum BuildError {
    NotFound(i64),
    InvalidTransition {
        id: i64,
        from: BuildStatus,
        to: BuildStatus,
    },
    InvalidTask(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for BuildError {
    fn from(err: sqlx::Error) -> Self {
        BuildError::DatabaseError(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::NotFound(id) => write!(f, "build {} not found", id),
            BuildError::InvalidTransition { id, from, to } => {
                write!(f, "build {} cannot move from {:?} to {:?}", id, from, to)
            }
            BuildError::InvalidTask(msg) => write!(f, "invalid build task: {}", msg),
            BuildError::DatabaseError(err) => write!(f, "database error: {}", err),
        }
    }
}

impl std::error::Error for BuildError {}

// =============================================================================
// Summary Lifecycle
// =============================================================================

/// Create a summary in the NIL state
pub async fn create_summary(pool: &PgPool, summary: &NewBuildSummary) -> Result<i64, BuildError> {
    let id = build_repository::create(pool, summary).await?;

    tracing::info!(build_id = id, hash = %summary.hash, "Build summary created for {}/{}", summary.account, summary.repo);

    Ok(id)
}

/// NIL -> QUEUED
pub async fn set_queued(pool: &PgPool, id: i64) -> Result<(), BuildError> {
    move_status(pool, id, BuildStatus::Queued).await
}

/// QUEUED -> RUNNING
pub async fn start_build(pool: &PgPool, id: i64) -> Result<(), BuildError> {
    move_status(pool, id, BuildStatus::Running).await
}

/// QUEUED -> FAILED_PRESTART
pub async fn fail_prestart(pool: &PgPool, id: i64) -> Result<(), BuildError> {
    move_status(pool, id, BuildStatus::FailedPrestart).await
}

/// RUNNING -> PASSED | FAILED
///
/// Returns the finished summary.
pub async fn finish_build(
    pool: &PgPool,
    id: i64,
    failed: bool,
    duration: f64,
) -> Result<BuildSummary, BuildError> {
    let summary = get_build(pool, id).await?;
    let to = if failed {
        BuildStatus::Failed
    } else {
        BuildStatus::Passed
    };
    ensure_transition(id, summary.status, to)?;

    if !build_repository::finish(pool, id, to, duration).await? {
        return Err(BuildError::InvalidTransition {
            id,
            from: summary.status,
            to,
        });
    }

    tracing::info!(build_id = id, "Build finished with status {:?} in {:.1}s", to, duration);

    Ok(BuildSummary {
        status: to,
        build_duration: Some(duration),
        ..summary
    })
}

async fn move_status(pool: &PgPool, id: i64, to: BuildStatus) -> Result<(), BuildError> {
    let summary = get_build(pool, id).await?;
    ensure_transition(id, summary.status, to)?;

    // The conditional update loses to a concurrent transition.
    if !build_repository::transition(pool, id, summary.status, to).await? {
        return Err(BuildError::InvalidTransition {
            id,
            from: summary.status,
            to,
        });
    }

    tracing::debug!(build_id = id, "Build moved from {:?} to {:?}", summary.status, to);
    Ok(())
}

// =============================================================================
// Queries
// =============================================================================

pub async fn get_build(pool: &PgPool, id: i64) -> Result<BuildSummary, BuildError> {
    build_repository::find_by_id(pool, id)
        .await?
        .ok_or(BuildError::NotFound(id))
}

/// Summary plus stage results
pub async fn get_details(pool: &PgPool, id: i64) -> Result<BuildDetails, BuildError> {
    let summary = get_build(pool, id).await?;
    let stages = build_repository::find_stages(pool, id).await?;
    Ok(BuildDetails { summary, stages })
}

pub async fn list_builds(pool: &PgPool) -> Result<Vec<BuildSummary>, BuildError> {
    Ok(build_repository::list_all(pool).await?)
}

pub async fn is_building(pool: &PgPool, hash: &str) -> Result<bool, BuildError> {
    Ok(build_repository::is_building(pool, hash).await?)
}

// =============================================================================
// Stage Details & Output
// =============================================================================

pub async fn add_stage(pool: &PgPool, id: i64, result: &StageResult) -> Result<(), BuildError> {
    get_build(pool, id).await?;
    build_repository::add_stage(pool, id, result).await?;

    tracing::debug!(build_id = id, stage = %result.stage, "Stored stage result {:?}", result.status);
    Ok(())
}

pub async fn get_stages(pool: &PgPool, id: i64) -> Result<Vec<StageResult>, BuildError> {
    get_build(pool, id).await?;
    Ok(build_repository::find_stages(pool, id).await?)
}

pub async fn add_output(pool: &PgPool, id: i64, chunk: &[u8]) -> Result<(), BuildError> {
    if chunk.is_empty() {
        return Ok(());
    }
    get_build(pool, id).await?;
    Ok(build_repository::add_output(pool, id, chunk).await?)
}

pub async fn get_output(pool: &PgPool, id: i64) -> Result<Vec<u8>, BuildError> {
    get_build(pool, id).await?;
    Ok(build_repository::find_output(pool, id).await?)
}

// =============================================================================
// Dispatch Queue
// =============================================================================

pub async fn enqueue(pool: &PgPool, task: &BuildTask) -> Result<(), BuildError> {
    let value = serde_json::to_value(task).map_err(|e| BuildError::InvalidTask(e.to_string()))?;
    queue_repository::enqueue(pool, task.id, task.machine_tag(), value).await?;

    tracing::info!(build_id = task.id, hash = %task.checkout_hash, machine_tag = ?task.machine_tag(), "Build task enqueued");
    Ok(())
}

/// Claim the oldest queued task the runner can run, if any
pub async fn claim_build(
    pool: &PgPool,
    runner_id: &str,
    machine_tags: &[String],
) -> Result<Option<BuildTask>, BuildError> {
    let Some(value) = queue_repository::claim_next(pool, runner_id, machine_tags).await? else {
        return Ok(None);
    };

    let task = decode_claimed(value, machine_tags)?;

    tracing::info!(build_id = task.id, "Runner {} claimed build", runner_id);
    Ok(Some(task))
}

fn decode_claimed(value: serde_json::Value, machine_tags: &[String]) -> Result<BuildTask, BuildError> {
    let task: BuildTask =
        serde_json::from_value(value).map_err(|e| BuildError::InvalidTask(e.to_string()))?;
    if !runner_accepts(machine_tags, task.machine_tag()) {
        return Err(BuildError::InvalidTask(format!(
            "build {} needs machine tag {:?}, runner serves {:?}",
            task.id,
            task.machine_tag(),
            machine_tags
        )));
    }
    Ok(task)
}

// =============================================================================
// Validation
// =============================================================================

fn ensure_transition(id: i64, from: BuildStatus, to: BuildStatus) -> Result<(), BuildError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BuildError::InvalidTransition { id, from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_transition_valid() {
        assert!(ensure_transition(1, BuildStatus::Nil, BuildStatus::Queued).is_ok());
        assert!(ensure_transition(1, BuildStatus::Queued, BuildStatus::Running).is_ok());
        assert!(ensure_transition(1, BuildStatus::Queued, BuildStatus::FailedPrestart).is_ok());
        assert!(ensure_transition(1, BuildStatus::Running, BuildStatus::Passed).is_ok());
    }

    fn queued(machine_tag: Option<&str>) -> serde_json::Value {
        let image = machine_tag.is_none().then_some("alpine");
        serde_json::json!({
            "id": 9,
            "full_name": "acme/widgets",
            "checkout_hash": "abc123",
            "branch": "main",
            "vcs_type": "Bitbucket",
            "build_config": {
                "image": image,
                "machine_tag": machine_tag,
                "services": [],
                "branches": ["main"],
                "env": [],
                "stages": []
            },
            "signaled_by": "Push",
            "vcs_token": "t",
            "vault_token": "v"
        })
    }

    #[test]
    fn test_tagged_task_is_not_handed_to_untagged_runner() {
        let err = decode_claimed(queued(Some("mac")), &[]).unwrap_err();
        assert!(matches!(err, BuildError::InvalidTask(_)));

        let task = decode_claimed(queued(Some("mac")), &["mac".to_string()]).unwrap();
        assert_eq!(task.machine_tag(), Some("mac"));
        assert!(decode_claimed(queued(None), &[]).is_ok());
        assert!(decode_claimed(queued(None), &["mac".to_string()]).is_err());
    }

    #[test]
    fn test_ensure_transition_invalid() {
        let err = ensure_transition(7, BuildStatus::Running, BuildStatus::FailedPrestart).unwrap_err();
        assert_eq!(err.to_string(), "build 7 cannot move from Running to FailedPrestart");
        assert!(ensure_transition(7, BuildStatus::Nil, BuildStatus::Running).is_err());
    }
}
