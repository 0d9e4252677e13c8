//! Queue Repository
//!
//! The dispatch queue. Enqueued tasks are claimed at most once; concurrent
//! claims skip rows another transaction already locked.
//!
//! Rows carry the task's machine tag. A runner with no tags only claims
//! untagged rows, a tagged runner only rows whose tag it serves.

use chrono::Utc;
use sqlx::PgPool;

/// Append a serialized task to the queue
pub async fn enqueue(
    pool: &PgPool,
    build_id: i64,
    machine_tag: Option<&str>,
    task: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO build_queue (build_id, machine_tag, task, enqueued_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(build_id)
    .bind(machine_tag)
    .bind(task)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Claim the oldest unclaimed task `runner_id` can run
pub async fn claim_next(
    pool: &PgPool,
    runner_id: &str,
    machine_tags: &[String],
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let row: Option<(serde_json::Value,)> = sqlx::query_as(
        r#"
        UPDATE build_queue
        SET claimed_by = $1, claimed_at = $2
        WHERE id = (
            SELECT id FROM build_queue
            WHERE claimed_by IS NULL
              AND (
                (machine_tag IS NULL AND cardinality($3::text[]) = 0)
                OR machine_tag = ANY($3::text[])
              )
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING task
        "#,
    )
    .bind(runner_id)
    .bind(Utc::now())
    .bind(machine_tags)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(task,)| task))
}
