//! Build Repository
//!
//! Handles all database operations on build summaries, stage details and
//! build output.

use chrono::{DateTime, Utc};
use kiln_core::domain::build::SignaledBy;
use kiln_core::domain::stage::{StageResult, StageStatus};
use kiln_core::domain::summary::{BuildStatus, BuildSummary, NewBuildSummary};
use sqlx::PgPool;

// =============================================================================
// Summaries
// =============================================================================

/// Create a summary row in the NIL state and return its id
pub async fn create(pool: &PgPool, summary: &NewBuildSummary) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO build_summary (hash, account, repo, branch, signaled_by, credential_id, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(&summary.hash)
    .bind(&summary.account)
    .bind(&summary.repo)
    .bind(&summary.branch)
    .bind(signaled_by_to_string(summary.signaled_by))
    .bind(summary.credential_id)
    .bind(status_to_string(BuildStatus::Nil))
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Find a summary by build id
pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<BuildSummary>, sqlx::Error> {
    let row = sqlx::query_as::<_, SummaryRow>(
        r#"
        SELECT id, hash, account, repo, branch, signaled_by, credential_id, status,
               created_at, queue_time, build_time, build_duration
        FROM build_summary
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List all summaries, newest first
pub async fn list_all(pool: &PgPool) -> Result<Vec<BuildSummary>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SummaryRow>(
        r#"
        SELECT id, hash, account, repo, branch, signaled_by, credential_id, status,
               created_at, queue_time, build_time, build_duration
        FROM build_summary
        ORDER BY id DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Whether any build of `hash` is queued or running
pub async fn is_building(pool: &PgPool, hash: &str) -> Result<bool, sqlx::Error> {
    let (building,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM build_summary WHERE hash = $1 AND status = ANY($2)
        )
        "#,
    )
    .bind(hash)
    .bind(vec![
        status_to_string(BuildStatus::Queued),
        status_to_string(BuildStatus::Running),
    ])
    .fetch_one(pool)
    .await?;

    Ok(building)
}

/// Move a summary from `from` to `to`
///
/// Returns false when the row does not exist or is not in `from`.
pub async fn transition(
    pool: &PgPool,
    id: i64,
    from: BuildStatus,
    to: BuildStatus,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE build_summary
        SET status = $1,
            queue_time = CASE WHEN $1 = 'Queued' THEN $2 ELSE queue_time END,
            build_time = CASE WHEN $1 = 'Running' THEN $2 ELSE build_time END
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(status_to_string(to))
    .bind(now)
    .bind(id)
    .bind(status_to_string(from))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record the terminal status and duration of a running build
pub async fn finish(
    pool: &PgPool,
    id: i64,
    status: BuildStatus,
    duration: f64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE build_summary
        SET status = $1, build_duration = $2
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(status_to_string(status))
    .bind(duration)
    .bind(id)
    .bind(status_to_string(BuildStatus::Running))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Stage Details
// =============================================================================

/// Append one stage result to a build
pub async fn add_stage(pool: &PgPool, build_id: i64, result: &StageResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO build_stage_detail (build_id, stage, status, error, messages, start_time, duration)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(build_id)
    .bind(&result.stage)
    .bind(stage_status_to_string(result.status))
    .bind(&result.error)
    .bind(sqlx::types::Json(&result.messages))
    .bind(result.start_time)
    .bind(result.duration)
    .execute(pool)
    .await?;

    Ok(())
}

/// Stage results of a build in the order they were stored
pub async fn find_stages(pool: &PgPool, build_id: i64) -> Result<Vec<StageResult>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StageRow>(
        r#"
        SELECT stage, status, error, messages, start_time, duration
        FROM build_stage_detail
        WHERE build_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(build_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Output
// =============================================================================

pub async fn add_output(pool: &PgPool, build_id: i64, chunk: &[u8]) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO build_output (build_id, chunk, created_at)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(build_id)
    .bind(chunk)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Every chunk of a build's output, concatenated in arrival order
pub async fn find_output(pool: &PgPool, build_id: i64) -> Result<Vec<u8>, sqlx::Error> {
    let chunks: Vec<(Vec<u8>,)> = sqlx::query_as(
        r#"
        SELECT chunk FROM build_output
        WHERE build_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(build_id)
    .fetch_all(pool)
    .await?;

    Ok(chunks.into_iter().flat_map(|(chunk,)| chunk).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

pub(crate) fn status_to_string(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Nil => "Nil",
        BuildStatus::Queued => "Queued",
        BuildStatus::Running => "Running",
        BuildStatus::Passed => "Passed",
        BuildStatus::Failed => "Failed",
        BuildStatus::FailedPrestart => "FailedPrestart",
    }
}

fn string_to_status(s: &str) -> BuildStatus {
    match s {
        "Queued" => BuildStatus::Queued,
        "Running" => BuildStatus::Running,
        "Passed" => BuildStatus::Passed,
        "Failed" => BuildStatus::Failed,
        "FailedPrestart" => BuildStatus::FailedPrestart,
        _ => BuildStatus::Nil,
    }
}

fn signaled_by_to_string(by: SignaledBy) -> &'static str {
    match by {
        SignaledBy::Push => "Push",
        SignaledBy::PullRequest => "PullRequest",
        SignaledBy::Poll => "Poll",
        SignaledBy::Manual => "Manual",
        SignaledBy::Subscribed => "Subscribed",
    }
}

fn string_to_signaled_by(s: &str) -> SignaledBy {
    match s {
        "PullRequest" => SignaledBy::PullRequest,
        "Poll" => SignaledBy::Poll,
        "Manual" => SignaledBy::Manual,
        "Subscribed" => SignaledBy::Subscribed,
        _ => SignaledBy::Push,
    }
}

fn stage_status_to_string(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Nil => "Nil",
        StageStatus::Pass => "Pass",
        StageStatus::Fail => "Fail",
    }
}

fn string_to_stage_status(s: &str) -> StageStatus {
    match s {
        "Pass" => StageStatus::Pass,
        "Fail" => StageStatus::Fail,
        _ => StageStatus::Nil,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    hash: String,
    account: String,
    repo: String,
    branch: String,
    signaled_by: String,
    credential_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    queue_time: Option<DateTime<Utc>>,
    build_time: Option<DateTime<Utc>>,
    build_duration: Option<f64>,
}

impl From<SummaryRow> for BuildSummary {
    fn from(row: SummaryRow) -> Self {
        BuildSummary {
            id: row.id,
            hash: row.hash,
            account: row.account,
            repo: row.repo,
            branch: row.branch,
            signaled_by: string_to_signaled_by(&row.signaled_by),
            credential_id: row.credential_id,
            status: string_to_status(&row.status),
            created_at: row.created_at,
            queue_time: row.queue_time,
            build_time: row.build_time,
            build_duration: row.build_duration,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    stage: String,
    status: String,
    error: String,
    messages: sqlx::types::Json<Vec<String>>,
    start_time: DateTime<Utc>,
    duration: f64,
}

impl From<StageRow> for StageResult {
    fn from(row: StageRow) -> Self {
        StageResult {
            stage: row.stage,
            status: string_to_stage_status(&row.status),
            error: row.error,
            messages: row.messages.0,
            start_time: row.start_time,
            duration: row.duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            BuildStatus::Nil,
            BuildStatus::Queued,
            BuildStatus::Running,
            BuildStatus::Passed,
            BuildStatus::Failed,
            BuildStatus::FailedPrestart,
        ] {
            assert_eq!(string_to_status(status_to_string(status)), status);
        }
    }

    #[test]
    fn test_transition_sql_matches_status_strings() {
        assert_eq!(status_to_string(BuildStatus::Queued), "Queued");
        assert_eq!(status_to_string(BuildStatus::Running), "Running");
    }
}
