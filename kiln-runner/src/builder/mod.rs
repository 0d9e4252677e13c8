//! Build substrates
//!
//! A [`Builder`] prepares one substrate for one build (a container, a VM or
//! the bare host), runs stages on it and releases it again. Builders are never
//! reused across builds.
//!
//! All variants compose a [`Basher`] for the commands they run and push their
//! output through the log multiplexer, tagged with the stage label.

mod docker;
mod host;
mod process;
mod vagrant;

use anyhow::Result;
use async_trait::async_trait;
use bollard::Docker;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::stage::{CHECKMARK, FAILED_MARK, Stage, StageLabel, StageResult};
use kiln_core::interface::CredentialStore;
use kiln_core::metrics::MetricsSink;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::basher::Basher;
use crate::cleaner::{Cleaner, DockerCleaner, NoopCleaner};
use crate::logstream::LogSink;

pub use docker::DockerBuilder;
pub use host::HostBuilder;
pub use vagrant::VagrantBuilder;

/// Error text of a stage whose process exited nonzero
pub const NONZERO_EXIT: &str = "exit code was not 0";

/// Error text of a stage interrupted by the build's cancellation token
pub const CANCELLED: &str = "build was cancelled";

/// One build's execution substrate
#[async_trait]
pub trait Builder: Send + Sync {
    /// Prepares the substrate and checks out the code
    ///
    /// The substrate id is sent on `id_sink` as soon as it exists; the sender
    /// is dropped unsent when there is none.
    ///
    /// # Returns
    /// The setup stage result and the substrate id (empty if none)
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        logs: &LogSink,
        id_sink: oneshot::Sender<String>,
        task: &BuildTask,
        creds: &dyn CredentialStore,
        host_port: &str,
    ) -> (StageResult, String);

    /// Runs a user stage inside the clone directory of `commit_hash`
    async fn execute(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        logs: &LogSink,
        commit_hash: &str,
    ) -> StageResult;

    /// Runs a generated script as-is, labelled with `label`
    async fn execute_integration(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        label: &StageLabel,
        logs: &LogSink,
    ) -> StageResult;

    /// Releases whatever the builder still owns
    async fn teardown(&mut self) -> Result<()>;
}

/// Substrate variant selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Docker,
    Vagrant,
    Host,
}

impl FromStr for BuilderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "vagrant" => Ok(Self::Vagrant),
            "host" => Ok(Self::Host),
            other => anyhow::bail!("unknown builder kind {:?}, expected docker, vagrant or host", other),
        }
    }
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Vagrant => write!(f, "vagrant"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Creates a fresh builder per build, plus the matching cleaner
pub struct BuilderFactory {
    kind: BuilderKind,
    basher: Basher,
    docker: Option<Docker>,
    vault_addr: String,
    metrics: Arc<dyn MetricsSink>,
}

impl BuilderFactory {
    /// Connects to the docker daemon when the kind needs it
    pub fn new(
        kind: BuilderKind,
        basher: Basher,
        docker_socket: &str,
        vault_addr: &str,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let docker = match kind {
            BuilderKind::Docker => Some(Docker::connect_with_socket(
                docker_socket,
                120,
                bollard::API_DEFAULT_VERSION,
            )?),
            _ => None,
        };

        Ok(Self {
            kind,
            vault_addr: basher.vault_addr_for_build(vault_addr),
            basher,
            docker,
            metrics,
        })
    }

    pub fn kind(&self) -> BuilderKind {
        self.kind
    }

    pub fn create(&self) -> Box<dyn Builder> {
        match (&self.kind, &self.docker) {
            (BuilderKind::Docker, Some(docker)) => Box::new(DockerBuilder::new(
                docker.clone(),
                self.basher.clone(),
                &self.vault_addr,
                Arc::clone(&self.metrics),
            )),
            (BuilderKind::Vagrant, _) => Box::new(VagrantBuilder::new(self.basher.clone())),
            _ => Box::new(HostBuilder::new(self.basher.clone())),
        }
    }

    pub fn cleaner(&self) -> Arc<dyn Cleaner> {
        match &self.docker {
            Some(docker) => Arc::new(DockerCleaner::new(docker.clone())),
            None => Arc::new(NoopCleaner),
        }
    }
}

/// Turns a process exit into a stage result
///
/// `exit` is the exit code, or why none could be obtained.
pub fn exit_result(label: &StageLabel, exit: std::result::Result<i64, String>) -> StageResult {
    match exit {
        Ok(0) => StageResult::pass(
            label.stage(),
            vec![format!("completed {} stage {}", label.stage(), CHECKMARK)],
        ),
        Ok(_) => StageResult::fail(
            label.stage(),
            NONZERO_EXIT,
            vec![failed_message(label)],
        ),
        Err(e) => StageResult::fail(label.stage(), e, vec![failed_message(label)]),
    }
}

fn failed_message(label: &StageLabel) -> String {
    format!("failed to complete {} stage {}", label.stage(), FAILED_MARK)
}

/// Failed setup result carrying the messages gathered so far
pub(crate) fn setup_failure(
    label: &StageLabel,
    error: impl Into<String>,
    messages: &[String],
) -> StageResult {
    StageResult::fail(label.stage(), error, Vec::new()).with_prior_messages(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::stage::StageStatus;

    #[test]
    fn test_exit_zero_passes() {
        let label = StageLabel::new("build");
        let result = exit_result(&label, Ok(0));
        assert_eq!(result.status, StageStatus::Pass);
        assert!(result.error.is_empty());
        assert_eq!(result.messages, vec!["completed build stage \u{2713}"]);
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let label = StageLabel::new("test");
        let result = exit_result(&label, Ok(1));
        assert_eq!(result.status, StageStatus::Fail);
        assert_eq!(result.error, "exit code was not 0");
        assert_eq!(result.messages, vec!["failed to complete test stage \u{2717}"]);
    }

    #[test]
    fn test_inspect_error_fails_with_its_text() {
        let label = StageLabel::new("deploy");
        let result = exit_result(&label, Err("no such exec".to_string()));
        assert!(result.is_failed());
        assert_eq!(result.error, "no such exec");
    }

    #[test]
    fn test_setup_failure_keeps_prior_messages_first() {
        let label = StageLabel::new("setup");
        let prior = vec!["pulled image alpine \u{2713}".to_string()];
        let result = setup_failure(&label, "boom", &prior);
        assert!(result.is_failed());
        assert_eq!(result.messages, prior);
    }

    #[test]
    fn test_builder_kind_parse() {
        assert_eq!("docker".parse::<BuilderKind>().unwrap(), BuilderKind::Docker);
        assert_eq!("Vagrant".parse::<BuilderKind>().unwrap(), BuilderKind::Vagrant);
        assert_eq!("host".parse::<BuilderKind>().unwrap(), BuilderKind::Host);
        assert!("k8s".parse::<BuilderKind>().is_err());
        assert_eq!(BuilderKind::Host.to_string(), "host");
    }
}
