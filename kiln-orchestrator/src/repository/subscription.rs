//! Subscription Repository

use kiln_core::domain::build::VcsType;
use kiln_core::domain::summary::ActiveSubscription;
use kiln_core::dto::subscription::NewSubscription;
use sqlx::PgPool;

pub async fn create(pool: &PgPool, sub: &NewSubscription) -> Result<ActiveSubscription, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO subscriptions (subscribed_to, subscribed_branch, subscriber, subscriber_branch, vcs_type)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(&sub.subscribed_to)
    .bind(&sub.subscribed_branch)
    .bind(&sub.subscriber)
    .bind(&sub.subscriber_branch)
    .bind(vcs_type_to_string(sub.vcs_type))
    .fetch_one(pool)
    .await?;

    Ok(ActiveSubscription {
        id,
        subscribed_to: sub.subscribed_to.clone(),
        subscribed_branch: sub.subscribed_branch.clone(),
        subscriber: sub.subscriber.clone(),
        subscriber_branch: sub.subscriber_branch.clone(),
        vcs_type: sub.vcs_type,
    })
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<ActiveSubscription>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT id, subscribed_to, subscribed_branch, subscriber, subscriber_branch, vcs_type
        FROM subscriptions
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Subscriptions waiting on `subscribed_to` at `branch`
pub async fn find_by_upstream(
    pool: &PgPool,
    subscribed_to: &str,
    branch: &str,
) -> Result<Vec<ActiveSubscription>, sqlx::Error> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT id, subscribed_to, subscribed_branch, subscriber, subscriber_branch, vcs_type
        FROM subscriptions
        WHERE subscribed_to = $1 AND subscribed_branch = $2
        ORDER BY id ASC
        "#,
    )
    .bind(subscribed_to)
    .bind(branch)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Link a build to the upstream build that caused it
pub async fn record_build(
    pool: &PgPool,
    subscription_id: i64,
    upstream_build_id: i64,
    build_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subscription_builds (subscription_id, upstream_build_id, build_id)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(subscription_id)
    .bind(upstream_build_id)
    .bind(build_id)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn vcs_type_to_string(vcs_type: VcsType) -> &'static str {
    match vcs_type {
        VcsType::Bitbucket => "Bitbucket",
        VcsType::Github => "Github",
    }
}

fn string_to_vcs_type(s: &str) -> VcsType {
    match s {
        "Github" => VcsType::Github,
        _ => VcsType::Bitbucket,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    subscribed_to: String,
    subscribed_branch: String,
    subscriber: String,
    subscriber_branch: String,
    vcs_type: String,
}

impl From<SubscriptionRow> for ActiveSubscription {
    fn from(row: SubscriptionRow) -> Self {
        ActiveSubscription {
            id: row.id,
            subscribed_to: row.subscribed_to,
            subscribed_branch: row.subscribed_branch,
            subscriber: row.subscriber,
            subscriber_branch: row.subscriber_branch,
            vcs_type: string_to_vcs_type(&row.vcs_type),
        }
    }
}
