//! VM builder
//!
//! Brings a VM up with `vagrant up` in a per-commit directory under
//! `<kiln dir>/vagrant/<hash>` and runs stages through `vagrant ssh`.
//!
//! Setup spawns a supervised task that waits for the build's cancellation
//! token and then destroys the VM. [`Builder::teardown`] joins that task.
//!
//! Environment, tokens included, reaches the guest through a `kiln.env` file
//! in the VM directory (synced to `/vagrant`), never through the ssh argv.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use kiln_core::domain::build::BuildTask;
use kiln_core::domain::stage::{CHECKMARK, FAILED_MARK, Stage, StageLabel, StageResult};
use kiln_core::interface::CredentialStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::process::run_logged;
use super::{Builder, exit_result, setup_failure};
use crate::basher::{Basher, export_env, shell_quote};
use crate::logstream::{LogSink, send_line};

const ENV_FILE: &str = "kiln.env";
const GUEST_ENV_FILE: &str = "/vagrant/kiln.env";

/// Tears down the VM living in a directory
#[async_trait]
pub trait VmDestroyer: Send + Sync {
    async fn destroy(&self, dir: PathBuf) -> Result<()>;
}

/// `vagrant destroy -f`, then removes the directory
struct VagrantDestroy;

#[async_trait]
impl VmDestroyer for VagrantDestroy {
    async fn destroy(&self, dir: PathBuf) -> Result<()> {
        destroy_vm(dir).await
    }
}

pub struct VagrantBuilder {
    basher: Basher,
    global_env: Vec<String>,
    vm_dir: Option<PathBuf>,
    destroyer: Arc<dyn VmDestroyer>,
    supervisor: Option<JoinHandle<Result<()>>>,
}

impl VagrantBuilder {
    pub fn new(basher: Basher) -> Self {
        Self {
            basher,
            global_env: Vec::new(),
            vm_dir: None,
            destroyer: Arc::new(VagrantDestroy),
            supervisor: None,
        }
    }

    #[cfg(test)]
    fn with_destroyer(basher: Basher, destroyer: Arc<dyn VmDestroyer>) -> Self {
        Self {
            destroyer,
            ..Self::new(basher)
        }
    }

    /// Directory holding the Vagrantfile and state of the VM for `hash`
    pub fn vm_dir(&self, hash: &str) -> PathBuf {
        Path::new(&self.basher.kiln_dir()).join("vagrant").join(hash)
    }

    /// Destroys the VM in `dir` once `cancel` fires
    ///
    /// The VM lives until the build token fires, whatever setup does next.
    fn supervise(&mut self, dir: PathBuf, cancel: &CancellationToken) {
        let build_token = cancel.clone();
        let destroyer = Arc::clone(&self.destroyer);
        self.supervisor = Some(tokio::spawn(async move {
            build_token.cancelled().await;
            destroyer.destroy(dir).await
        }));
    }

    async fn run_in_vm(
        &self,
        cancel: &CancellationToken,
        label: &StageLabel,
        env: &[String],
        script: &str,
        logs: &LogSink,
    ) -> StageResult {
        let Some(dir) = self.vm_dir.as_deref() else {
            return StageResult::fail(label.stage(), "no vm exists, setup before executing", Vec::new());
        };
        let mut full_env = self.global_env.clone();
        full_env.extend_from_slice(env);
        let env_file = match write_env_file(dir, &full_env).await {
            Ok(path) => path,
            Err(e) => {
                let error = format!("could not write build environment: {}", e);
                return StageResult::fail(label.stage(), error, Vec::new());
            }
        };

        let exit = run_logged(cancel, &ssh_command(script), &[], Some(dir), label, logs).await;
        if let Err(e) = tokio::fs::remove_file(&env_file).await {
            warn!("could not remove {}: {}", env_file.display(), e);
        }
        exit_result(label, exit)
    }
}

/// Wraps a guest script into a `vagrant ssh` invocation that loads the env file
fn ssh_command(script: &str) -> Vec<String> {
    vec![
        "vagrant".to_string(),
        "ssh".to_string(),
        "-c".to_string(),
        format!(". {} && {}", GUEST_ENV_FILE, script),
    ]
}

/// Writes `env` as export statements into an owner-only file in `dir`
async fn write_env_file(dir: &Path, env: &[String]) -> std::io::Result<PathBuf> {
    let path = dir.join(ENV_FILE);
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&path).await?;
    file.write_all(export_env(env).as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}

async fn create_vm_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

async fn destroy_vm(dir: PathBuf) -> Result<()> {
    info!("destroying vm in {}", dir.display());
    let status = tokio::process::Command::new("vagrant")
        .args(["destroy", "-f"])
        .current_dir(&dir)
        .status()
        .await
        .context("Failed to run vagrant destroy")?;
    if !status.success() {
        anyhow::bail!("vagrant destroy exited with {}", status);
    }
    tokio::fs::remove_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to remove {}", dir.display()))?;
    Ok(())
}

#[async_trait]
impl Builder for VagrantBuilder {
    async fn setup(
        &mut self,
        cancel: &CancellationToken,
        logs: &LogSink,
        id_sink: oneshot::Sender<String>,
        task: &BuildTask,
        _creds: &dyn CredentialStore,
        host_port: &str,
    ) -> (StageResult, String) {
        let start = Utc::now();
        let label = StageLabel::new("setup");
        let mut messages = vec!["attempting to create VM with vagrant...".to_string()];

        self.global_env = task.standard_env();
        self.global_env.extend(task.build_config.env.iter().cloned());

        let dir = self.vm_dir(&task.checkout_hash);
        if let Err(e) = create_vm_dir(&dir).await {
            drop(id_sink);
            let error = format!("could not create vm directory: {}", e);
            return (setup_failure(&label, error, &messages).timed_from(start), String::new());
        }
        let substrate_id = dir.to_string_lossy().to_string();
        let _ = id_sink.send(substrate_id.clone());
        self.vm_dir = Some(dir.clone());

        self.supervise(dir, cancel);

        send_line(logs, label.label(), "Bringing up vm...");
        let up = vec!["vagrant".to_string(), "up".to_string()];
        let exit = run_logged(cancel, &up, &[], self.vm_dir.as_deref(), &label, logs).await;
        let up_result = exit_result(&label, exit);
        if up_result.is_failed() {
            messages.push(format!("vagrant up command failed {}", FAILED_MARK));
            return (
                up_result.with_prior_messages(&messages).timed_from(start),
                substrate_id,
            );
        }
        messages.push(format!("successfully created vm with vagrant up {}", CHECKMARK));

        messages.push("attempting to download codebase...".to_string());
        let templates = self
            .basher
            .sleepless_download_templates(self.basher.loopback_ip(), host_port);
        let download = self.basher.download_codebase(task);
        let guest_script = format!(
            "{} && {}",
            templates,
            download.cmd.iter().map(|c| shell_quote(c)).collect::<Vec<_>>().join(" ")
        );
        let result = self
            .run_in_vm(cancel, &label, &download.env, &guest_script, logs)
            .await;
        if result.is_failed() {
            return (result.with_prior_messages(&messages).timed_from(start), substrate_id);
        }

        messages.push(format!("completed setup stage {}", CHECKMARK));
        (
            StageResult::pass(label.stage(), messages).timed_from(start),
            substrate_id,
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
        let script = self.basher.cd_and_run_script(&stage.script, commit_hash);
        self.run_in_vm(cancel, &label, &stage.env, &script, logs).await
    }

    async fn execute_integration(
        &self,
        cancel: &CancellationToken,
        stage: &Stage,
        label: &StageLabel,
        logs: &LogSink,
    ) -> StageResult {
        let script = stage
            .script
            .iter()
            .map(|c| shell_quote(c))
            .collect::<Vec<_>>()
            .join(" ");
        self.run_in_vm(cancel, label, &stage.env, &script, logs).await
    }

    async fn teardown(&mut self) -> Result<()> {
        let Some(supervisor) = self.supervisor.take() else {
            return Ok(());
        };
        match supervisor.await {
            Ok(result) => result,
            Err(e) => {
                warn!("vm teardown task failed: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_dir_layout() {
        let builder = VagrantBuilder::new(Basher::new("", "127.0.0.1", "/srv").unwrap());
        assert_eq!(builder.vm_dir("abc"), PathBuf::from("/srv/.kiln/vagrant/abc"));
    }

    #[test]
    fn test_ssh_command_sources_env_file() {
        let cmd = ssh_command("cd /abc && make");
        assert_eq!(
            cmd,
            vec!["vagrant", "ssh", "-c", ". /vagrant/kiln.env && cd /abc && make"]
        );
    }

    #[tokio::test]
    async fn test_env_file_keeps_tokens_out_of_argv() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let env = vec!["GIT_BRANCH=main".to_string(), "KILN_VCS_TOKEN=s3cr3t".to_string()];

        let path = write_env_file(dir.path(), &env).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "export GIT_BRANCH='main'; export KILN_VCS_TOKEN='s3cr3t'; "
        );

        // Rewriting replaces the previous file instead of appending to it.
        write_env_file(dir.path(), &env[..1]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "export GIT_BRANCH='main'; ");

        assert!(ssh_command("make").iter().all(|arg| !arg.contains("s3cr3t")));
    }

    #[tokio::test]
    async fn test_execute_without_vm_fails() {
        let builder = VagrantBuilder::new(Basher::new("", "127.0.0.1", "").unwrap());
        let (tx, _rx) = crate::logstream::channel();
        let stage = Stage::new("build", vec!["make".to_string()], vec![]);
        let result = builder
            .execute(&CancellationToken::new(), &stage, &tx, "abc")
            .await;
        assert!(result.is_failed());
        assert_eq!(result.error, "no vm exists, setup before executing");
    }

    #[tokio::test]
    async fn test_vm_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("vagrant").join("abc");
        create_vm_dir(&dir).await.unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_teardown_without_setup() {
        let mut builder = VagrantBuilder::new(Basher::new("", "127.0.0.1", "").unwrap());
        assert!(builder.teardown().await.is_ok());
    }

    struct SlowDestroy {
        destroyed: Arc<std::sync::Mutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl VmDestroyer for SlowDestroy {
        async fn destroy(&self, dir: PathBuf) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            self.destroyed.lock().unwrap().push(dir);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancel_destroys_vm_before_teardown_returns() {
        let destroyed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let destroyer = Arc::new(SlowDestroy {
            destroyed: Arc::clone(&destroyed),
        });
        let mut builder =
            VagrantBuilder::with_destroyer(Basher::new("", "127.0.0.1", "").unwrap(), destroyer);
        let token = CancellationToken::new();

        builder.supervise(PathBuf::from("/srv/.kiln/vagrant/abc"), &token);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(destroyed.lock().unwrap().is_empty());

        token.cancel();
        builder.teardown().await.unwrap();
        assert_eq!(
            *destroyed.lock().unwrap(),
            vec![PathBuf::from("/srv/.kiln/vagrant/abc")]
        );
    }

    struct FailingDestroy;

    #[async_trait]
    impl VmDestroyer for FailingDestroy {
        async fn destroy(&self, _dir: PathBuf) -> Result<()> {
            anyhow::bail!("vagrant destroy exited with 1")
        }
    }

    #[tokio::test]
    async fn test_teardown_reports_destroy_failure() {
        let mut builder =
            VagrantBuilder::with_destroyer(Basher::new("", "127.0.0.1", "").unwrap(), Arc::new(FailingDestroy));
        let token = CancellationToken::new();
        builder.supervise(PathBuf::from("/tmp/vm"), &token);
        token.cancel();

        let err = builder.teardown().await.unwrap_err();
        assert_eq!(err.to_string(), "vagrant destroy exited with 1");
    }
}
