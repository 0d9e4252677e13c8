//! Subscription Service

use kiln_core::domain::build::split_full_name;
use kiln_core::domain::summary::ActiveSubscription;
use kiln_core::dto::subscription::NewSubscription;
use sqlx::PgPool;

use crate::repository::subscription_repository;

/// Service error type
#[derive(Debug)]
pub enum SubscriptionError {
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for SubscriptionError {
    fn from(err: sqlx::Error) -> Self {
        SubscriptionError::DatabaseError(err)
    }
}

pub async fn add_subscription(
    pool: &PgPool,
    sub: &NewSubscription,
) -> Result<ActiveSubscription, SubscriptionError> {
    validate_subscription(sub)?;
    let created = subscription_repository::create(pool, sub).await?;

    tracing::info!(
        "{}@{} now builds after {}@{} passes",
        sub.subscriber,
        sub.subscriber_branch,
        sub.subscribed_to,
        sub.subscribed_branch
    );
    Ok(created)
}

pub async fn list_subscriptions(pool: &PgPool) -> Result<Vec<ActiveSubscription>, SubscriptionError> {
    Ok(subscription_repository::list_all(pool).await?)
}

// =============================================================================
// Validation
// =============================================================================

fn validate_subscription(sub: &NewSubscription) -> Result<(), SubscriptionError> {
    for name in [&sub.subscribed_to, &sub.subscriber] {
        if split_full_name(name).is_none() {
            return Err(SubscriptionError::ValidationError(format!(
                "{:?} is not an account/repo name",
                name
            )));
        }
    }
    if sub.subscribed_branch.is_empty() || sub.subscriber_branch.is_empty() {
        return Err(SubscriptionError::ValidationError("branches cannot be empty".to_string()));
    }
    if sub.subscribed_to == sub.subscriber && sub.subscribed_branch == sub.subscriber_branch {
        return Err(SubscriptionError::ValidationError(
            "a branch cannot subscribe to itself".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::build::VcsType;

    fn sub() -> NewSubscription {
        NewSubscription {
            subscribed_to: "acme/lib".to_string(),
            subscribed_branch: "main".to_string(),
            subscriber: "acme/app".to_string(),
            subscriber_branch: "main".to_string(),
            vcs_type: VcsType::Bitbucket,
        }
    }

    #[test]
    fn test_validate_subscription() {
        assert!(validate_subscription(&sub()).is_ok());

        let mut bad = sub();
        bad.subscriber = "app".to_string();
        assert!(validate_subscription(&bad).is_err());

        let mut cycle = sub();
        cycle.subscriber = "acme/lib".to_string();
        assert!(validate_subscription(&cycle).is_err());
    }
}
