//! Container builder
//!
//! Setup pulls the image, creates and starts a container whose entrypoint
//! downloads the helper templates and then sleeps, waits for the template
//! sentinel on the container log, and then runs the dependency install,
//! checkout and SSH key download as execs.
//!
//! Stages run as execs in the same container. The container itself is killed
//! and removed by the cleaner once the build token fires, so teardown has
//! nothing left to do.

use anyhow::Result;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config, CreateContainerOptions, LogOutput, LogsOptions, StartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures_util::StreamExt;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::credential::{CredentialType, credential_path, vcs_identifier, vcs_sub_type};
use kiln_core::domain::stage::{CHECKMARK, Stage, StageLabel, StageResult};
use kiln_core::interface::CredentialStore;
use kiln_core::metrics::{IMAGE_PULL_FALLBACKS, MetricsSink};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::run_logged;
use super::{Builder, CANCELLED, exit_result, setup_failure};
use crate::basher::{Basher, shell_quote};
use crate::logstream::{LogSink, SourceTail, TEMPLATE_SENTINEL, TailState, send_line, tail_stream};

const DOCKER_SOCKET_BIND: &str = "/var/run/docker.sock:/var/run/docker.sock";

pub struct DockerBuilder {
    docker: Docker,
    basher: Basher,
    vault_addr: String,
    metrics: Arc<dyn MetricsSink>,
    container_id: Option<String>,
}

impl DockerBuilder {
    pub fn new(
        docker: Docker,
        basher: Basher,
        vault_addr: &str,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            docker,
            basher,
            vault_addr: vault_addr.to_string(),
            metrics,
            container_id: None,
        }
    }

    /// Pulls through the API, falling back to the docker CLI
    async fn pull_image(
        &self,
        cancel: &CancellationToken,
        image: &str,
        label: &StageLabel,
        logs: &LogSink,
    ) -> Result<(), String> {
        let (from_image, tag) = split_image(image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        let mut api_error = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(e) = info.error {
                        api_error = Some(e);
                        break;
                    }
                    if let (Some(status), None) = (info.status, info.progress) {
                        send_line(logs, label.label(), &status);
                    }
                }
                Err(e) => {
                    api_error = Some(e.to_string());
                    break;
                }
            }
        }

        let Some(api_error) = api_error else {
            return Ok(());
        };

        warn!("api pull of {} failed ({}), trying docker cli", image, api_error);
        self.metrics.inc(IMAGE_PULL_FALLBACKS, &[image]);
        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("docker pull {}", shell_quote(image)),
        ];
        match run_logged(cancel, &cmd, &[], None, label, logs).await {
            Ok(0) => Ok(()),
            Ok(_) => Err(format!("could not pull image {}: {}", image, api_error)),
            Err(e) => Err(format!("could not pull image {}: {}", image, e)),
        }
    }

    /// Runs `cmd` as an exec in the build container
    async fn exec(
        &self,
        cancel: &CancellationToken,
        label: &StageLabel,
        env: &[String],
        cmd: &[String],
        logs: &LogSink,
    ) -> StageResult {
        let Some(container_id) = self.container_id.as_deref() else {
            return StageResult::fail(
                label.stage(),
                "no container exists, setup before executing",
                Vec::new(),
            );
        };

        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            env: Some(env.iter().map(String::as_str).collect()),
            cmd: Some(cmd.iter().map(String::as_str).collect()),
            ..Default::default()
        };

        let created = match self.docker.create_exec(container_id, options).await {
            Ok(created) => created,
            Err(e) => return exit_result(label, Err(e.to_string())),
        };

        let started = match self.docker.start_exec(&created.id, None).await {
            Ok(started) => started,
            Err(e) => return exit_result(label, Err(e.to_string())),
        };

        if let StartExecResults::Attached { output, .. } = started {
            let output = output.map(|chunk| chunk.map(LogOutput::into_bytes));
            let tail = SourceTail::new(label.label(), logs.clone());
            tokio::select! {
                _ = cancel.cancelled() => return exit_result(label, Err(CANCELLED.to_string())),
                _ = tail_stream(output, tail) => {}
            }
        }

        let exit = match self.docker.inspect_exec(&created.id).await {
            Ok(inspect) => inspect
                .exit_code
                .ok_or_else(|| "exec exit code unavailable".to_string()),
            Err(e) => Err(e.to_string()),
        };
        exit_result(label, exit)
    }

    /// Forwards the container log until the bootstrap sentinel shows up
    async fn wait_for_templates(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        label: &StageLabel,
        logs: &LogSink,
    ) -> Result<(), String> {
        let stream = self
            .docker
            .logs(
                container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|chunk| chunk.map(LogOutput::into_bytes));
        let tail = SourceTail::new(label.label(), logs.clone()).with_sentinel(TEMPLATE_SENTINEL);

        let state = tokio::select! {
            _ = cancel.cancelled() => return Err(CANCELLED.to_string()),
            state = tail_stream(Box::pin(stream), tail) => state,
        };

        match state {
            TailState::SentinelSeen => Ok(()),
            TailState::Errored => Err("could not read container log".to_string()),
            _ => Err("container exited before templates were downloaded".to_string()),
        }
    }
}

/// Splits an image reference into repository and tag, defaulting to `latest`
fn split_image(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        logs: &LogSink,
        id_sink: oneshot::Sender<String>,
        task: &BuildTask,
        creds: &dyn CredentialStore,
        host_port: &str,
    ) -> (StageResult, String) {
        let start = Utc::now();
        let label = StageLabel::new("setup");
        let mut messages: Vec<String> = Vec::new();

        send_line(logs, label.label(), "Setting up...");

        let Some(image) = task.build_config.image.clone() else {
            let result = setup_failure(&label, "no image in build configuration", &messages);
            return (result.timed_from(start), String::new());
        };

        if let Err(e) = self.pull_image(cancel, &image, &label, logs).await {
            error!(build_id = task.id, "returning failed setup because image pull failed");
            return (setup_failure(&label, e, &messages).timed_from(start), String::new());
        }
        messages.push(format!("pulled image {} {}", image, CHECKMARK));

        send_line(logs, label.label(), "Creating container...");
        let mut env = task.standard_env();
        env.extend(task.build_config.env.iter().cloned());

        let config = Config {
            image: Some(image.clone()),
            user: Some("root".to_string()),
            env: Some(env),
            cmd: Some(self.basher.download_templates(host_port)),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![DOCKER_SOCKET_BIND.to_string()]),
                network_mode: Some("host".to_string()),
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = match self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                error!(build_id = task.id, "returning failed setup because container could not be created");
                return (setup_failure(&label, e.to_string(), &messages).timed_from(start), String::new());
            }
        };
        messages.push(format!("created build container {}", CHECKMARK));
        for warning in &created.warnings {
            send_line(logs, label.label(), warning);
        }

        let container_id = created.id;
        debug!("sending container id {} to the cleaner", container_id);
        let _ = id_sink.send(container_id.clone());
        self.container_id = Some(container_id.clone());
        send_line(logs, label.label(), &format!("Container created with ID {}", container_id));

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            error!(build_id = task.id, "returning failed setup because container could not start");
            return (setup_failure(&label, e.to_string(), &messages).timed_from(start), container_id);
        }
        send_line(logs, label.label(), &format!("Container {} started", container_id));

        if let Err(e) = self.wait_for_templates(cancel, &container_id, &label, logs).await {
            return (setup_failure(&label, e, &messages).timed_from(start), container_id);
        }

        messages.push("attempting to download kiln package dependencies...".to_string());
        let installed = self
            .exec(cancel, &label, &[], &self.basher.install_package_deps(), logs)
            .await;
        if installed.is_failed() {
            error!(build_id = task.id, "an error happened installing package deps: {}", installed.error);
            return (installed.with_prior_messages(&messages).timed_from(start), container_id);
        }

        messages.push("attempting to download codebase...".to_string());
        let download = self.basher.download_codebase(task);
        let downloaded = self
            .exec(cancel, &label, &download.env, &download.cmd, logs)
            .await;
        if downloaded.is_failed() {
            error!(build_id = task.id, "an error happened downloading the codebase: {}", downloaded.error);
            return (downloaded.with_prior_messages(&messages).timed_from(start), container_id);
        }

        send_line(logs, label.label(), "Retrieving SSH Key");
        let account = task.account();
        let sub_type = vcs_sub_type(task.vcs_type);
        let identifier = vcs_identifier(task.vcs_type, account);
        let key_path = credential_path(CredentialType::Vcs, account, sub_type, &identifier);

        match creds.check_ssh_key_exists(&key_path).await {
            Ok(true) => {
                info!(build_id = task.id, "using secret store at {}", self.vault_addr);
                messages.push(format!("downloading SSH key for {}...", task.full_name));
                let script = self
                    .basher
                    .download_ssh_key(&task.vault_token, &key_path, &self.vault_addr);
                let result = self.exec(cancel, &label, &script.env, &script.cmd, logs).await;
                if result.is_failed() {
                    error!(build_id = task.id, "an error happened downloading the ssh key: {}", result.error);
                    return (result.with_prior_messages(&messages).timed_from(start), container_id);
                }
                messages.push(format!("successfully downloaded SSH key for {}  {}", task.full_name, CHECKMARK));
            }
            Ok(false) => {
                messages.push(format!("no SSH key stored for {}, skipping download", task.full_name));
            }
            Err(e) => {
                let error = format!("could not check for SSH key: {:#}", e);
                return (setup_failure(&label, error, &messages).timed_from(start), container_id);
            }
        }

        messages.push(format!("completed setup stage {}", CHECKMARK));
        (
            StageResult::pass(label.stage(), messages).timed_from(start),
            container_id,
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
        let cmd = self.basher.cd_and_run(&stage.script, commit_hash);
        self.exec(cancel, &label, &stage.env, &cmd, logs).await
    }

    async fn execute_integration(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        label: &StageLabel,
        logs: &LogSink,
    ) -> StageResult {
        self.exec(cancel, label, &stage.env, &stage.script, logs).await
    }

    async fn teardown(&mut self) -> Result<()> {
        self.container_id = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("alpine"), ("alpine", "latest"));
        assert_eq!(split_image("alpine:3.19"), ("alpine", "3.19"));
        assert_eq!(
            split_image("registry.local:5000/team/app"),
            ("registry.local:5000/team/app", "latest")
        );
        assert_eq!(
            split_image("registry.local:5000/team/app:v2"),
            ("registry.local:5000/team/app", "v2")
        );
        assert_eq!(split_image("app@sha256:abcd"), ("app@sha256:abcd", ""));
    }
}
