//! Local process executor implementation.

use async_trait::async_trait;
use conveyor_core::executor::{StepExecutor, StepExit, StepSpec, StepStreams};
use conveyor_core::{Error, Result};
use futures::{FutureExt, StreamExt};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs a step's commands as a local shell process.
///
/// Intended for development and single-host deployments; the step's
/// `image` field is ignored here because there is no container runtime
/// between the executor and the host.
pub struct LocalProcessExecutor {
    shell: String,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, cancel: CancellationToken, spec: StepSpec) -> Result<StepStreams> {
        if !spec.image.is_empty() {
            debug!(step_id = %spec.step_id, image = %spec.image, "ignoring image for local execution");
        }

        // Commands run as a single script so a nonzero exit aborts the rest.
        let script = if spec.commands.is_empty() {
            "true".to_string()
        } else {
            spec.commands.join(" && ")
        };

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        debug!(step_id = %spec.step_id, job_id = %spec.job_id, "spawning step process");
        let mut child = command
            .spawn()
            .map_err(|e| Error::Infrastructure(format!("failed to spawn step process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Infrastructure("stdout pipe missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Infrastructure("stderr pipe missing".to_string()))?;

        let step_id = spec.step_id;
        let timeout = spec.timeout;
        let wait = tokio::spawn(async move {
            let deadline = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => StepExit::Code(status.code().unwrap_or(-1)),
                    Err(e) => {
                        warn!(step_id = %step_id, error = %e, "failed to reap step process");
                        StepExit::Code(-1)
                    }
                },
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    StepExit::Cancelled
                }
                _ = deadline => {
                    warn!(step_id = %step_id, "step timed out, killing process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    // GNU timeout's convention for a killed command.
                    StepExit::Code(124)
                }
            }
        });

        Ok(StepStreams {
            stdout: ReaderStream::new(stdout).boxed(),
            stderr: ReaderStream::new(stderr).boxed(),
            exit: async move { wait.await.unwrap_or(StepExit::Cancelled) }.boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use conveyor_core::{JobId, StepId};
    use std::collections::HashMap;
    use std::time::Duration;

    fn spec(commands: Vec<&str>) -> StepSpec {
        StepSpec {
            step_id: StepId::new(),
            job_id: JobId::new(),
            image: String::new(),
            commands: commands.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    async fn drain(mut stream: futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>) -> BytesMut {
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.expect("stream read"));
        }
        buf
    }

    #[tokio::test]
    async fn test_stdout_and_exit_zero() {
        let executor = LocalProcessExecutor::new();
        let streams = executor
            .run(CancellationToken::new(), spec(vec!["echo build ok"]))
            .await
            .unwrap();

        let out = drain(streams.stdout).await;
        assert_eq!(out.as_ref(), b"build ok\n");
        assert_eq!(streams.exit.await, StepExit::Code(0));
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let executor = LocalProcessExecutor::new();
        let streams = executor
            .run(CancellationToken::new(), spec(vec!["exit 3"]))
            .await
            .unwrap();

        drain(streams.stdout).await;
        assert_eq!(streams.exit.await, StepExit::Code(3));
    }

    #[tokio::test]
    async fn test_failed_command_aborts_rest() {
        let executor = LocalProcessExecutor::new();
        let streams = executor
            .run(
                CancellationToken::new(),
                spec(vec!["echo first", "false", "echo never"]),
            )
            .await
            .unwrap();

        let out = drain(streams.stdout).await;
        assert_eq!(out.as_ref(), b"first\n");
        assert_eq!(streams.exit.await, StepExit::Code(1));
    }

    #[tokio::test]
    async fn test_stderr_separate_from_stdout() {
        let executor = LocalProcessExecutor::new();
        let streams = executor
            .run(CancellationToken::new(), spec(vec!["echo oops >&2"]))
            .await
            .unwrap();

        let out = drain(streams.stdout).await;
        let err = drain(streams.stderr).await;
        assert!(out.is_empty());
        assert_eq!(err.as_ref(), b"oops\n");
        assert_eq!(streams.exit.await, StepExit::Code(0));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let executor = LocalProcessExecutor::new();
        let cancel = CancellationToken::new();
        let streams = executor
            .run(cancel.clone(), spec(vec!["sleep 30"]))
            .await
            .unwrap();

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), streams.exit)
            .await
            .expect("cancelled process must exit promptly");
        assert_eq!(exit, StepExit::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_shell_is_infrastructure_failure() {
        let executor = LocalProcessExecutor::with_shell("/nonexistent/shell");
        let result = executor
            .run(CancellationToken::new(), spec(vec!["echo hi"]))
            .await;
        assert!(matches!(result.unwrap_err(), Error::Infrastructure(_)));
    }
}
