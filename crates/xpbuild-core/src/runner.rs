//! External process execution with cooperative cancellation.

use crate::error::{Result, XpBuildError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured result of one child-process run.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Interleaved stdout and stderr, line-oriented.
    pub output: String,

    /// Exit code, if the process ran to completion and reported one.
    pub exit_code: Option<i32>,

    /// Whether the run was cut short by cancellation. Output captured up to
    /// that point is still present.
    pub interrupted: bool,
}

impl ProcessOutput {
    /// Whether the process completed with a zero exit code.
    pub fn succeeded(&self) -> bool {
        !self.interrupted && self.exit_code == Some(0)
    }
}

/// Runs a command and captures its text output.
///
/// Implementations must kill the child when the token fires and still return
/// whatever output was captured, since some failures are detectable from a
/// truncated log.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        command: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput>;
}

/// Production runner on top of `tokio::process`.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| XpBuildError::Spawn {
                command: command.display().to_string(),
                source,
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut output = String::new();
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(line) => {
                        debug!(target: "toolchain", "{line}");
                        output.push_str(&line);
                        output.push('\n');
                    }
                    // Both streams closed; the process is done or dying.
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    while let Ok(line) = rx.try_recv() {
                        output.push_str(&line);
                        output.push('\n');
                    }
                    return Ok(ProcessOutput {
                        output,
                        exit_code: None,
                        interrupted: true,
                    });
                }
            }
        }

        let status = child.wait().await?;
        Ok(ProcessOutput {
            output,
            exit_code: status.code(),
            interrupted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(
                Path::new("echo"),
                &["hello".to_string()],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.interrupted);
        assert!(result.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = TokioProcessRunner;
        let result = runner
            .run(Path::new("false"), &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.succeeded());
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_distinct() {
        let runner = TokioProcessRunner;
        let err = runner
            .run(
                &PathBuf::from("/nonexistent-binary-that-does-not-exist"),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, XpBuildError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child_and_keeps_partial_output() {
        let runner = TokioProcessRunner;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let result = runner
            .run(
                Path::new("sh"),
                &[
                    "-c".to_string(),
                    "echo started; sleep 30; echo finished".to_string(),
                ],
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.interrupted);
        assert!(result.output.contains("started"));
        assert!(!result.output.contains("finished"));
    }
}
