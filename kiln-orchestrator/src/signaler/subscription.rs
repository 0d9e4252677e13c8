//! Subscription chaining
//!
//! When an upstream build passes, every repository subscribed to that
//! upstream branch gets a forced build of its own branch head.

use anyhow::Result;
use async_trait::async_trait;
use kiln_core::domain::build::SignaledBy;
use kiln_core::domain::summary::{ActiveSubscription, BuildStatus, BuildSummary, TaskBuilderEvent};
use kiln_core::dto::signal::{SignalRequest, SignalResponse};
use kiln_core::interface::VcsHandler;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Signaler, fetch_config};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_upstream(&self, full_name: &str, branch: &str) -> Result<Vec<ActiveSubscription>>;

    async fn record_build(&self, subscription_id: i64, event: &TaskBuilderEvent, build_id: i64) -> Result<()>;
}

pub struct SubscriptionChainer {
    subs: Arc<dyn SubscriptionStore>,
    vcs: Arc<dyn VcsHandler>,
    signaler: Arc<Signaler>,
}

impl SubscriptionChainer {
    pub fn new(subs: Arc<dyn SubscriptionStore>, vcs: Arc<dyn VcsHandler>, signaler: Arc<Signaler>) -> Self {
        Self { subs, vcs, signaler }
    }

    /// Signals subscriber builds for a finished upstream build
    ///
    /// Builds that did not pass trigger nothing. A subscriber that cannot be
    /// signaled is logged and skipped so it does not block the others.
    pub async fn on_build_passed(&self, upstream: &BuildSummary) -> Result<Vec<SignalResponse>> {
        if upstream.status != BuildStatus::Passed {
            return Ok(Vec::new());
        }

        let full_name = format!("{}/{}", upstream.account, upstream.repo);
        let subs = self.subs.find_by_upstream(&full_name, &upstream.branch).await?;
        if subs.is_empty() {
            return Ok(Vec::new());
        }

        let event = TaskBuilderEvent {
            upstream_build_id: upstream.id,
            upstream_full_name: full_name,
            upstream_branch: upstream.branch.clone(),
            upstream_hash: upstream.hash.clone(),
        };

        let mut responses = Vec::with_capacity(subs.len());
        for sub in &subs {
            match self.signal_subscriber(sub, &event).await {
                Ok(response) => responses.push(response),
                Err(e) => warn!(
                    subscription = sub.id,
                    subscriber = %sub.subscriber,
                    "unable to build subscriber of {}: {:#}", event.upstream_full_name, e
                ),
            }
        }
        Ok(responses)
    }

    async fn signal_subscriber(&self, sub: &ActiveSubscription, event: &TaskBuilderEvent) -> Result<SignalResponse> {
        let head = self
            .vcs
            .get_branch_last_commit_data(&sub.subscriber, &sub.subscriber_branch)
            .await?;
        let config = fetch_config(self.vcs.as_ref(), &sub.subscriber, &head.hash).await?;

        let request = SignalRequest {
            full_name: sub.subscriber.clone(),
            branch: sub.subscriber_branch.clone(),
            hash: head.hash.clone(),
            vcs_type: sub.vcs_type,
            vcs_token: self.vcs.access_token().to_string(),
            signaled_by: SignaledBy::Subscribed,
            config,
            commits: vec![head],
            force: true,
        };
        let response = self.signaler.signal(&request).await?;

        if let SignalResponse::Queued { build_id } = response {
            info!(build_id, subscriber = %sub.subscriber, upstream = event.upstream_build_id,
                "queued subscription build");
            self.subs.record_build(sub.id, event, build_id).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaler::tests::{CONFIG, FakeVcs, harness};
    use chrono::Utc;
    use kiln_core::domain::build::VcsType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSubscriptions {
        subs: Vec<ActiveSubscription>,
        recorded: Mutex<Vec<(i64, i64, i64)>>,
    }

    #[async_trait]
    impl SubscriptionStore for FakeSubscriptions {
        async fn find_by_upstream(&self, full_name: &str, branch: &str) -> Result<Vec<ActiveSubscription>> {
            Ok(self
                .subs
                .iter()
                .filter(|s| s.subscribed_to == full_name && s.subscribed_branch == branch)
                .cloned()
                .collect())
        }

        async fn record_build(&self, subscription_id: i64, event: &TaskBuilderEvent, build_id: i64) -> Result<()> {
            self.recorded
                .lock()
                .unwrap()
                .push((subscription_id, event.upstream_build_id, build_id));
            Ok(())
        }
    }

    fn subscription(id: i64, subscriber: &str) -> ActiveSubscription {
        ActiveSubscription {
            id,
            subscribed_to: "acme/core".to_string(),
            subscribed_branch: "main".to_string(),
            subscriber: subscriber.to_string(),
            subscriber_branch: "main".to_string(),
            vcs_type: VcsType::Bitbucket,
        }
    }

    fn upstream(status: BuildStatus) -> BuildSummary {
        BuildSummary {
            id: 42,
            hash: "c0ffee".to_string(),
            account: "acme".to_string(),
            repo: "core".to_string(),
            branch: "main".to_string(),
            signaled_by: SignaledBy::Push,
            credential_id: 1,
            status,
            created_at: Utc::now(),
            queue_time: None,
            build_time: None,
            build_duration: Some(3.0),
        }
    }

    #[tokio::test]
    async fn test_passed_build_signals_subscribers() {
        let h = harness();
        let subs = Arc::new(FakeSubscriptions {
            subs: vec![subscription(7, "acme/app"), subscription(8, "acme/broken")],
            ..Default::default()
        });
        // acme/broken has no commits, so it is skipped
        let vcs = FakeVcs::default().with_repo("acme/app", &["a1"], Some(CONFIG));
        let chainer = SubscriptionChainer::new(subs.clone(), Arc::new(vcs), h.signaler.clone());

        let responses = chainer.on_build_passed(&upstream(BuildStatus::Passed)).await.unwrap();

        assert_eq!(responses, vec![SignalResponse::Queued { build_id: 1 }]);
        assert_eq!(*subs.recorded.lock().unwrap(), vec![(7, 42, 1)]);
        let tasks = h.queue.tasks.lock().unwrap();
        assert_eq!(tasks[0].full_name, "acme/app");
        assert_eq!(tasks[0].signaled_by, SignaledBy::Subscribed);
    }

    #[tokio::test]
    async fn test_failed_build_signals_nothing() {
        let h = harness();
        let subs = Arc::new(FakeSubscriptions {
            subs: vec![subscription(7, "acme/app")],
            ..Default::default()
        });
        let vcs = FakeVcs::default().with_repo("acme/app", &["a1"], Some(CONFIG));
        let chainer = SubscriptionChainer::new(subs.clone(), Arc::new(vcs), h.signaler.clone());

        let responses = chainer.on_build_passed(&upstream(BuildStatus::Failed)).await.unwrap();

        assert!(responses.is_empty());
        assert!(h.queue.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_build_bypasses_branch_filter() {
        let h = harness();
        let mut sub = subscription(7, "acme/app");
        sub.subscriber_branch = "develop".to_string();
        let subs = Arc::new(FakeSubscriptions {
            subs: vec![sub],
            ..Default::default()
        });
        let vcs = FakeVcs::default().with_repo("acme/app", &["a1"], Some(CONFIG));
        let chainer = SubscriptionChainer::new(subs, Arc::new(vcs), h.signaler.clone());

        let responses = chainer.on_build_passed(&upstream(BuildStatus::Passed)).await.unwrap();

        assert_eq!(responses, vec![SignalResponse::Queued { build_id: 1 }]);
    }
}
