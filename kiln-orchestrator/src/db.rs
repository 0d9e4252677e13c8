use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create build summary table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_summary (
            id BIGSERIAL PRIMARY KEY,
            hash VARCHAR(64) NOT NULL,
            account VARCHAR(255) NOT NULL,
            repo VARCHAR(255) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            signaled_by VARCHAR(50) NOT NULL,
            credential_id BIGINT NOT NULL,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            queue_time TIMESTAMPTZ,
            build_time TIMESTAMPTZ,
            build_duration DOUBLE PRECISION
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create stage detail table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_stage_detail (
            id BIGSERIAL PRIMARY KEY,
            build_id BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
            stage VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            error TEXT NOT NULL DEFAULT '',
            messages JSONB NOT NULL DEFAULT '[]',
            start_time TIMESTAMPTZ NOT NULL,
            duration DOUBLE PRECISION NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create output table, one row per flushed chunk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_output (
            id BIGSERIAL PRIMARY KEY,
            build_id BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
            chunk BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create dispatch queue table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_queue (
            id BIGSERIAL PRIMARY KEY,
            build_id BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
            machine_tag VARCHAR(255),
            task JSONB NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL,
            claimed_by VARCHAR(255),
            claimed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Queues created before machine tag routing
    sqlx::query("ALTER TABLE build_queue ADD COLUMN IF NOT EXISTS machine_tag VARCHAR(255)")
        .execute(pool)
        .await?;

    // Create credentials tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id BIGSERIAL PRIMARY KEY,
            account VARCHAR(255) NOT NULL,
            identifier VARCHAR(255) NOT NULL,
            cred_type VARCHAR(20) NOT NULL,
            sub_type VARCHAR(50) NOT NULL,
            secret TEXT NOT NULL,
            UNIQUE (account, cred_type, identifier)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ssh_keys (
            path VARCHAR(512) PRIMARY KEY,
            key TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create subscription tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id BIGSERIAL PRIMARY KEY,
            subscribed_to VARCHAR(255) NOT NULL,
            subscribed_branch VARCHAR(255) NOT NULL,
            subscriber VARCHAR(255) NOT NULL,
            subscriber_branch VARCHAR(255) NOT NULL,
            vcs_type VARCHAR(20) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_builds (
            subscription_id BIGINT NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            upstream_build_id BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
            build_id BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
            PRIMARY KEY (subscription_id, build_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_summary_hash ON build_summary(hash, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_build_stage_detail_build_id ON build_stage_detail(build_id, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_output_build_id ON build_output(build_id, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_build_queue_unclaimed ON build_queue(id) WHERE claimed_by IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_subscriptions_upstream ON subscriptions(subscribed_to, subscribed_branch)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
