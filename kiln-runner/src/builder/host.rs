//! Bare-host builder
//!
//! Checks the code out on the runner's own host and runs every stage as a
//! local subprocess. Meant for builds that cannot run in a container.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::stage::{CHECKMARK, Stage, StageLabel, StageResult};
use kiln_core::interface::CredentialStore;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::process::run_logged;
use super::{Builder, exit_result, setup_failure};
use crate::basher::Basher;
use crate::logstream::{LogSink, send_line};

pub struct HostBuilder {
    basher: Basher,
    /// Standard build env plus the config's env, set during setup
    global_env: Vec<String>,
}

impl HostBuilder {
    pub fn new(basher: Basher) -> Self {
        Self {
            basher,
            global_env: Vec::new(),
        }
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        label: &StageLabel,
        env: &[String],
        cmds: &[String],
        logs: &LogSink,
    ) -> StageResult {
        let mut full_env = self.global_env.clone();
        full_env.extend_from_slice(env);
        let exit = run_logged(cancel, cmds, &full_env, None, label, logs).await;
        exit_result(label, exit)
    }
}

#[async_trait]
impl Builder for HostBuilder {
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        logs: &LogSink,
        id_sink: oneshot::Sender<String>,
        task: &BuildTask,
        _creds: &dyn CredentialStore,
        host_port: &str,
    ) -> (StageResult, String) {
        // No substrate to clean up.
        drop(id_sink);

        let start = Utc::now();
        let label = StageLabel::new("setup");
        let mut messages = Vec::new();

        self.global_env = task.standard_env();
        self.global_env.extend(task.build_config.env.iter().cloned());

        send_line(logs, label.label(), "Setting up on host...");
        messages.push("attempting to download templates...".to_string());
        let templates = self
            .basher
            .sleepless_download_templates(self.basher.loopback_ip(), host_port);
        let cmds = vec!["/bin/sh".to_string(), "-c".to_string(), templates];
        let result = self.run(cancel, &label, &[], &cmds, logs).await;
        if result.is_failed() {
            return (result.with_prior_messages(&messages).timed_from(start), String::new());
        }

        messages.push("attempting to download codebase...".to_string());
        let download = self.basher.download_codebase(task);
        let result = self.run(cancel, &label, &download.env, &download.cmd, logs).await;
        if result.is_failed() {
            debug!("codebase download failed for {}", task.checkout_hash);
            return (result.with_prior_messages(&messages).timed_from(start), String::new());
        }

        if cancel.is_cancelled() {
            return (
                setup_failure(&label, super::CANCELLED, &messages).timed_from(start),
                String::new(),
            );
        }

        messages.push("running dockerless".to_string());
        messages.push(format!("completed setup stage {}", CHECKMARK));
        (
            StageResult::pass(label.stage(), messages).timed_from(start),
            String::new(),
        )
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        logs: &LogSink,
        commit_hash: &str,
    ) -> StageResult {
        let label = StageLabel::new(&stage.name);
        let cmds = self.basher.cd_and_run_host(&stage.script, commit_hash);
        self.run(cancel, &label, &stage.env, &cmds, logs).await
    }

    async fn execute_integration(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        label: &StageLabel,
        logs: &LogSink,
    ) -> StageResult {
        self.run(cancel, label, &stage.env, &stage.script, logs).await
    }

    async fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream;
    use kiln_core::domain::stage::StageStatus;

    fn builder(prefix: &str) -> HostBuilder {
        HostBuilder::new(Basher::new("", "127.0.0.1", prefix).unwrap())
    }

    fn lines(rx: &mut logstream::LogReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(String::from_utf8(line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_execute_runs_script_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abc123")).unwrap();
        let builder = builder(dir.path().to_str().unwrap());
        let (tx, mut rx) = logstream::channel();

        let stage = Stage::new(
            "build",
            vec!["echo hi".to_string(), "sleep 1".to_string(), "echo bye".to_string()],
            vec![],
        );
        let result = builder
            .execute(&CancellationToken::new(), &stage, &tx, "abc123")
            .await;

        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(result.stage, "build");
        let out = lines(&mut rx);
        let hi = out.iter().position(|l| l == "BUILD | hi").unwrap();
        let bye = out.iter().position(|l| l == "BUILD | bye").unwrap();
        assert!(hi < bye);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_despite_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abc123")).unwrap();
        let builder = builder(dir.path().to_str().unwrap());
        let (tx, mut rx) = logstream::channel();

        let stage = Stage::new(
            "test",
            vec!["echo partial".to_string(), "exit 2".to_string()],
            vec![],
        );
        let result = builder
            .execute(&CancellationToken::new(), &stage, &tx, "abc123")
            .await;

        assert!(result.is_failed());
        assert!(!result.error.is_empty());
        assert!(lines(&mut rx).contains(&"TEST | partial".to_string()));
    }

    #[tokio::test]
    async fn test_stage_runs_in_clone_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("abc123")).unwrap();
        std::fs::write(dir.path().join("abc123").join("marker"), "").unwrap();
        let builder = builder(dir.path().to_str().unwrap());
        let (tx, mut rx) = logstream::channel();

        let stage = Stage::new(
            "check",
            vec!["test -f marker".to_string(), "echo $GREETING".to_string()],
            vec!["GREETING=hello".to_string()],
        );
        let result = builder
            .execute(&CancellationToken::new(), &stage, &tx, "abc123")
            .await;

        assert_eq!(result.status, StageStatus::Pass);
        assert!(lines(&mut rx).contains(&"CHECK | hello".to_string()));
    }

    #[tokio::test]
    async fn test_execute_integration_uses_substage_label() {
        let builder = builder("");
        let (tx, mut rx) = logstream::channel();
        let label = StageLabel::new("integration_util").substage("ssh key");
        let stage = Stage::new(
            label.stage(),
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo installed".to_string()],
            vec![],
        );

        let result = builder
            .execute_integration(&CancellationToken::new(), &stage, &label, &tx)
            .await;

        assert_eq!(result.stage, "integration_util | ssh key");
        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(
            lines(&mut rx),
            vec!["INTEGRATION_UTIL | SSH KEY | installed"]
        );
    }
}
