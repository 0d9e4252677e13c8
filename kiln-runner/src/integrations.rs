//! Integration stage
//!
//! Runs after setup and before the user stages as `integration_util`. Each
//! integration looks up one credential of the build's account and, if there
//! is one, renders it into the substrate (SSH key, docker registry login,
//! kubeconfig). A missing credential is not an error; the integration is
//! simply not needed.
//!
//! Secrets travel to the substrate as environment variables of the generated
//! script. They never appear in the script text or in messages.

use anyhow::Result;
use chrono::Utc;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::credential::{Credential, CredentialType};
use kiln_core::domain::stage::{CHECKMARK, FAILED_MARK, Stage, StageLabel, StageResult};
use kiln_core::error::CredentialError;
use kiln_core::interface::CredentialStore;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::builder::Builder;
use crate::logstream::LogSink;

pub const INTEGRATION_STAGE: &str = "integration_util";

/// Renders one kind of credential into a script
pub trait Integration: Send + Sync {
    /// Substage name, e.g. `ssh key`
    fn name(&self) -> &'static str;

    fn cred_type(&self) -> CredentialType;

    /// Identifier the credential is stored under for an account
    fn identifier(&self) -> &'static str;

    /// Produces the script that installs `cred`
    fn render(&self, label: &StageLabel, cred: &Credential) -> Result<Stage>;
}

/// Writes the account's SSH key to `~/.ssh/id_rsa`
pub struct SshKeyIntegration;

impl Integration for SshKeyIntegration {
    fn name(&self) -> &'static str {
        "ssh key"
    }

    fn cred_type(&self) -> CredentialType {
        CredentialType::Ssh
    }

    fn identifier(&self) -> &'static str {
        "sshkey"
    }

    fn render(&self, label: &StageLabel, cred: &Credential) -> Result<Stage> {
        Ok(Stage::new(
            label.stage(),
            sh("mkdir -p ~/.ssh && echo \"${KILN_SSH_KEY}\" > ~/.ssh/id_rsa && chmod 600 ~/.ssh/id_rsa && echo \"StrictHostKeyChecking no\" >> ~/.ssh/config"),
            vec![format!("KILN_SSH_KEY={}", cred.secret)],
        ))
    }
}

/// Writes a docker `config.json` for the account's registry
pub struct DockerConfigIntegration;

#[derive(Deserialize)]
struct RegistryLogin {
    registry: String,
    username: String,
    password: String,
}

impl Integration for DockerConfigIntegration {
    fn name(&self) -> &'static str {
        "docker login"
    }

    fn cred_type(&self) -> CredentialType {
        CredentialType::Repo
    }

    fn identifier(&self) -> &'static str {
        "docker"
    }

    fn render(&self, label: &StageLabel, cred: &Credential) -> Result<Stage> {
        // serde errors may quote the input, so they are not passed on.
        let login: RegistryLogin = serde_json::from_str(&cred.secret).map_err(|_| {
            anyhow::anyhow!(
                "docker credential {} must be JSON with registry, username and password",
                cred.identifier
            )
        })?;

        Ok(Stage::new(
            label.stage(),
            sh("mkdir -p ~/.docker && printf '{\"auths\":{\"%s\":{\"auth\":\"%s\"}}}' \"${KILN_DOCKER_REGISTRY}\" \"$(printf '%s:%s' \"${KILN_DOCKER_USER}\" \"${KILN_DOCKER_PASSWORD}\" | base64 | tr -d '\\n')\" > ~/.docker/config.json"),
            vec![
                format!("KILN_DOCKER_REGISTRY={}", login.registry),
                format!("KILN_DOCKER_USER={}", login.username),
                format!("KILN_DOCKER_PASSWORD={}", login.password),
            ],
        ))
    }
}

/// Writes the account's kubeconfig to `~/.kube/config`
pub struct KubeconfigIntegration;

impl Integration for KubeconfigIntegration {
    fn name(&self) -> &'static str {
        "kubeconfig render"
    }

    fn cred_type(&self) -> CredentialType {
        CredentialType::K8s
    }

    fn identifier(&self) -> &'static str {
        "kubeconfig"
    }

    fn render(&self, label: &StageLabel, cred: &Credential) -> Result<Stage> {
        Ok(Stage::new(
            label.stage(),
            sh("mkdir -p ~/.kube && echo \"${KILN_KUBECONFIG}\" > ~/.kube/config"),
            vec![format!("KILN_KUBECONFIG={}", cred.secret)],
        ))
    }
}

pub fn default_integrations() -> Vec<Box<dyn Integration>> {
    vec![
        Box::new(SshKeyIntegration),
        Box::new(DockerConfigIntegration),
        Box::new(KubeconfigIntegration),
    ]
}

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Runs every integration against `builder`
///
/// # Returns
/// One `integration_util` result: PASS with the messages of every
/// integration, or the first failing substage's result
pub async fn run_integrations(
    cancel: &CancellationToken,
    builder: &dyn Builder,
    task: &BuildTask,
    creds: &dyn CredentialStore,
    integrations: &[Box<dyn Integration>],
    logs: &LogSink,
) -> StageResult {
    let start = Utc::now();
    let base = StageLabel::new(INTEGRATION_STAGE);
    let account = task.account();
    let mut messages = Vec::new();

    for integration in integrations {
        let label = base.substage(integration.name());

        let cred = match creds
            .get_cred(integration.cred_type(), integration.identifier(), account)
            .await
        {
            Ok(cred) => cred,
            Err(CredentialError::NotFound(_)) => {
                messages.push(format!(
                    "no integration data found for {} so assuming integration not necessary",
                    integration.name()
                ));
                continue;
            }
            Err(CredentialError::Other(e)) => {
                error!(build_id = task.id, "integration credential lookup failed for {}", integration.name());
                messages.push(format!("integration failed for {} {}", integration.name(), FAILED_MARK));
                return StageResult::fail(label.stage(), format!("{:#}", e), messages)
                    .timed_from(start);
            }
        };

        let stage = match integration.render(&label, &cred) {
            Ok(stage) => stage,
            Err(e) => {
                return StageResult::fail(label.stage(), e.to_string(), messages).timed_from(start);
            }
        };

        let result = builder
            .execute_integration(cancel, &stage, &label, logs)
            .await;
        if result.is_failed() {
            return result.with_prior_messages(&messages).timed_from(start);
        }
        info!(build_id = task.id, "finished integration {}", integration.name());
        messages.extend(result.messages);
    }

    messages.push(format!("completed integration util setup stage {}", CHECKMARK));
    StageResult::pass(base.stage(), messages).timed_from(start)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::domain::build::{SignaledBy, VcsType};
    use kiln_core::domain::config::BuildConfig;
    use kiln_core::domain::stage::StageStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Credentials keyed by identifier; `broken` identifiers fail with a non-NotFound error
    #[derive(Default)]
    pub(crate) struct FakeCredentials {
        pub creds: HashMap<String, Credential>,
        pub broken: Vec<String>,
        pub ssh_key: bool,
    }

    #[async_trait]
    impl CredentialStore for FakeCredentials {
        async fn get_cred(
            &self,
            _cred_type: CredentialType,
            identifier: &str,
            _account: &str,
        ) -> Result<Credential, CredentialError> {
            if self.broken.iter().any(|b| b == identifier) {
                return Err(CredentialError::Other(anyhow::anyhow!("secret store sealed")));
            }
            self.creds
                .get(identifier)
                .cloned()
                .ok_or_else(|| CredentialError::NotFound(identifier.to_string()))
        }

        async fn add_ssh_key(&self, _path: &str, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn check_ssh_key_exists(&self, _path: &str) -> Result<bool> {
            Ok(self.ssh_key)
        }

        async fn create_throwaway_token(&self) -> Result<String> {
            Ok("throwaway".to_string())
        }
    }

    /// Builder that records integration stages and passes them
    #[derive(Default)]
    struct RecordingBuilder {
        ran: Mutex<Vec<Stage>>,
        fail: bool,
    }

    #[async_trait]
    impl Builder for RecordingBuilder {
        async fn setup(
            &mut self,
            _cancel: &CancellationToken,
            _logs: &LogSink,
            _id_sink: oneshot::Sender<String>,
            _task: &BuildTask,
            _creds: &dyn CredentialStore,
            _host_port: &str,
        ) -> (StageResult, String) {
            (StageResult::pass("setup", vec![]), String::new())
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            stage: &Stage,
            _logs: &LogSink,
            _commit_hash: &str,
        ) -> StageResult {
            StageResult::pass(&stage.name, vec![])
        }

        async fn execute_integration(
            &self,
            _cancel: &CancellationToken,
            stage: &Stage,
            label: &StageLabel,
            _logs: &LogSink,
        ) -> StageResult {
            self.ran.lock().unwrap().push(stage.clone());
            if self.fail {
                StageResult::fail(label.stage(), "exit code was not 0", vec![])
            } else {
                StageResult::pass(label.stage(), vec![format!("completed {} stage", label.stage())])
            }
        }

        async fn teardown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn credential(identifier: &str, cred_type: CredentialType, secret: &str) -> Credential {
        Credential {
            id: 1,
            account: "acme".to_string(),
            identifier: identifier.to_string(),
            cred_type,
            sub_type: identifier.to_string(),
            secret: secret.to_string(),
        }
    }

    fn task() -> BuildTask {
        BuildTask {
            id: 3,
            full_name: "acme/widgets".to_string(),
            checkout_hash: "abc1234".to_string(),
            branch: "main".to_string(),
            vcs_type: VcsType::Github,
            build_config: BuildConfig::default(),
            signaled_by: SignaledBy::Push,
            vcs_token: String::new(),
            vault_token: String::new(),
        }
    }

    #[tokio::test]
    async fn test_no_credentials_passes() {
        let builder = RecordingBuilder::default();
        let (logs, _rx) = crate::logstream::channel();

        let result = run_integrations(
            &CancellationToken::new(),
            &builder,
            &task(),
            &FakeCredentials::default(),
            &default_integrations(),
            &logs,
        )
        .await;

        assert_eq!(result.status, StageStatus::Pass);
        assert_eq!(result.stage, "integration_util");
        assert_eq!(
            result.messages[0],
            "no integration data found for ssh key so assuming integration not necessary"
        );
        assert_eq!(
            result.messages.last().unwrap(),
            "completed integration util setup stage \u{2713}"
        );
        assert!(builder.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secrets_stay_out_of_scripts() {
        let mut creds = FakeCredentials::default();
        creds.creds.insert(
            "sshkey".to_string(),
            credential("sshkey", CredentialType::Ssh, "PRIVATE-KEY"),
        );
        creds.creds.insert(
            "docker".to_string(),
            credential(
                "docker",
                CredentialType::Repo,
                r#"{"registry":"registry.acme.io","username":"bot","password":"hunter2"}"#,
            ),
        );
        let builder = RecordingBuilder::default();
        let (logs, _rx) = crate::logstream::channel();

        let result = run_integrations(
            &CancellationToken::new(),
            &builder,
            &task(),
            &creds,
            &default_integrations(),
            &logs,
        )
        .await;
        assert_eq!(result.status, StageStatus::Pass);

        let ran = builder.ran.lock().unwrap();
        assert_eq!(ran.len(), 2);
        assert_eq!(ran[0].name, "integration_util | ssh key");
        assert!(ran[0].env.contains(&"KILN_SSH_KEY=PRIVATE-KEY".to_string()));
        assert!(ran[1].env.contains(&"KILN_DOCKER_PASSWORD=hunter2".to_string()));
        for stage in ran.iter() {
            let script = stage.script.join(" ");
            assert!(!script.contains("PRIVATE-KEY"));
            assert!(!script.contains("hunter2"));
        }
        assert!(result.messages.iter().all(|m| !m.contains("hunter2")));
    }

    #[tokio::test]
    async fn test_store_error_fails_stage() {
        let creds = FakeCredentials {
            broken: vec!["docker".to_string()],
            ..Default::default()
        };
        let builder = RecordingBuilder::default();
        let (logs, _rx) = crate::logstream::channel();

        let result = run_integrations(
            &CancellationToken::new(),
            &builder,
            &task(),
            &creds,
            &default_integrations(),
            &logs,
        )
        .await;

        assert!(result.is_failed());
        assert_eq!(result.stage, "integration_util | docker login");
        assert_eq!(result.error, "secret store sealed");
        assert_eq!(
            result.messages.last().unwrap(),
            "integration failed for docker login \u{2717}"
        );
    }

    #[tokio::test]
    async fn test_malformed_docker_credential_does_not_leak() {
        let mut creds = FakeCredentials::default();
        creds.creds.insert(
            "docker".to_string(),
            credential("docker", CredentialType::Repo, "hunter2"),
        );
        let builder = RecordingBuilder::default();
        let (logs, _rx) = crate::logstream::channel();

        let result = run_integrations(
            &CancellationToken::new(),
            &builder,
            &task(),
            &creds,
            &default_integrations(),
            &logs,
        )
        .await;

        assert!(result.is_failed());
        assert!(!result.error.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_failing_substage_keeps_earlier_messages() {
        let mut creds = FakeCredentials::default();
        creds.creds.insert(
            "kubeconfig".to_string(),
            credential("kubeconfig", CredentialType::K8s, "apiVersion: v1"),
        );
        let builder = RecordingBuilder {
            fail: true,
            ..Default::default()
        };
        let (logs, _rx) = crate::logstream::channel();

        let result = run_integrations(
            &CancellationToken::new(),
            &builder,
            &task(),
            &creds,
            &default_integrations(),
            &logs,
        )
        .await;

        assert!(result.is_failed());
        assert_eq!(result.stage, "integration_util | kubeconfig render");
        assert_eq!(result.messages.len(), 2);
        assert!(result.messages[0].contains("ssh key"));
        assert!(result.messages[1].contains("docker login"));
    }
}
