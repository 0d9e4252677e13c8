//! Local subprocess execution shared by the host and VM builders

use kiln_core::domain::stage::StageLabel;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CANCELLED;
use crate::logstream::{LogSink, SourceTail, tail_reader};

/// How long output tails may keep draining after the process exited
const TAIL_GRACE: Duration = Duration::from_secs(5);

/// Runs `cmds` as a subprocess, multiplexing stdout and stderr into `logs`
///
/// `env` is added on top of the runner's own environment.
///
/// # Returns
/// The exit code, or why the process could not be run to completion
pub async fn run_logged(
    cancel: &CancellationToken,
    cmds: &[String],
    env: &[String],
    dir: Option<&Path>,
    label: &StageLabel,
    logs: &LogSink,
) -> Result<i64, String> {
    let (program, args) = cmds
        .split_first()
        .ok_or_else(|| "no command to run".to_string())?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env.iter().filter_map(|a| a.split_once('=')) {
        command.env(key, value);
    }
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| format!("could not start {}: {}", program, e))?;

    let mut tails = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        tails.push(tokio::spawn(tail_reader(
            stdout,
            SourceTail::new(label.label(), logs.clone()),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        tails.push(tokio::spawn(tail_reader(
            stderr,
            SourceTail::new(label.label(), logs.clone()),
        )));
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("killing {} for stage {}", program, label.stage());
            if let Err(e) = child.kill().await {
                warn!("could not kill {}: {}", program, e);
            }
            for tail in tails {
                tail.abort();
            }
            return Err(CANCELLED.to_string());
        }
        status = child.wait() => status.map_err(|e| format!("waiting on {} failed: {}", program, e))?,
    };

    // Background children may hold the pipes open past the exit. Tails still
    // reading at the deadline are aborted so their sinks are released.
    let deadline = Instant::now() + TAIL_GRACE;
    for mut tail in tails {
        if tokio::time::timeout_at(deadline, &mut tail).await.is_err() {
            debug!("output of {} still open after exit", label.stage());
            tail.abort();
        }
    }

    status
        .code()
        .map(i64::from)
        .ok_or_else(|| format!("{} was terminated by a signal", program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logstream;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_output_is_labelled() {
        let (tx, mut rx) = logstream::channel();
        let label = StageLabel::new("build");
        let cancel = CancellationToken::new();

        let code = run_logged(&cancel, &sh("echo out; echo err >&2"), &[], None, &label, &tx).await;
        assert_eq!(code, Ok(0));

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(String::from_utf8(line).unwrap());
        }
        lines.sort();
        assert_eq!(lines, vec!["BUILD | err", "BUILD | out"]);
    }

    #[tokio::test]
    async fn test_env_and_exit_code() {
        let (tx, _rx) = logstream::channel();
        let label = StageLabel::new("test");
        let cancel = CancellationToken::new();
        let env = vec!["KILN_EXIT=3".to_string()];

        let code = run_logged(&cancel, &sh("exit $KILN_EXIT"), &env, None, &label, &tx).await;
        assert_eq!(code, Ok(3));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (tx, _rx) = logstream::channel();
        let cancel = CancellationToken::new();
        let cmds = vec!["/definitely/not/here".to_string()];

        let err = run_logged(&cancel, &cmds, &[], None, &StageLabel::new("x"), &tx)
            .await
            .unwrap_err();
        assert!(err.starts_with("could not start /definitely/not/here"));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let (tx, _rx) = logstream::channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_logged(&cancel, &sh("exec sleep 30"), &[], None, &StageLabel::new("x"), &tx).await;
        assert_eq!(result, Err(CANCELLED.to_string()));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_child_releases_log_sink() {
        let (tx, mut rx) = logstream::channel();
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let code = run_logged(&cancel, &sh("sleep 30 & echo done"), &[], None, &StageLabel::new("x"), &tx).await;
        assert_eq!(code, Ok(0));
        assert!(started.elapsed() < TAIL_GRACE + Duration::from_secs(3));

        drop(tx);
        let lines = tokio::time::timeout(Duration::from_secs(3), async move {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(String::from_utf8(line).unwrap());
            }
            lines
        })
        .await
        .expect("log channel still held open by an output tail");
        assert_eq!(lines, vec!["X | done"]);
    }
}
