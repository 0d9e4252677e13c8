//! Substrate cleanup
//!
//! Setup reports the substrate id on a one-shot channel. [`watch_substrate`]
//! waits for that id, then for the build token, and finally hands the id to a
//! [`Cleaner`]. A channel closed without an id means setup failed before any
//! substrate existed, so there is nothing to clean.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{KillContainerOptions, RemoveContainerOptions};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logstream::{LogSink, send_line};

const LABEL: &str = "CLEANUP | ";

#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self, substrate_id: &str, logs: &LogSink);
}

/// Kills and removes build containers
pub struct DockerCleaner {
    docker: Docker,
}

impl DockerCleaner {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl Cleaner for DockerCleaner {
    async fn cleanup(&self, substrate_id: &str, logs: &LogSink) {
        info!("killing container {}", substrate_id);
        send_line(logs, LABEL, &format!("Killing container {}", substrate_id));

        // A container that already exited refuses the kill; removal still applies.
        if let Err(e) = self
            .docker
            .kill_container(substrate_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            debug!("could not kill container {}: {}", substrate_id, e);
        }

        match self
            .docker
            .remove_container(
                substrate_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => send_line(logs, LABEL, &format!("Removed container {}", substrate_id)),
            Err(e) => {
                warn!("could not remove container {}: {}", substrate_id, e);
                send_line(logs, LABEL, &format!("Could not remove container {}", substrate_id));
            }
        }
    }
}

/// For substrates whose builder cleans up after itself
pub struct NoopCleaner;

#[async_trait]
impl Cleaner for NoopCleaner {
    async fn cleanup(&self, substrate_id: &str, _logs: &LogSink) {
        debug!("nothing to clean up for {}", substrate_id);
    }
}

/// Cleans the substrate up once the build token fires
pub fn watch_substrate(
    id_rx: oneshot::Receiver<String>,
    build: CancellationToken,
    cleaner: Arc<dyn Cleaner>,
    logs: LogSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let substrate_id = match id_rx.await {
            Ok(id) => id,
            Err(_) => {
                debug!("no substrate was created, skipping cleanup");
                return;
            }
        };
        build.cancelled().await;
        cleaner.cleanup(&substrate_id, &logs).await;
    })
}
