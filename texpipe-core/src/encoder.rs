//! External encoder process.
//!
//! [`TextureEncoder`] is the seam between the pipeline and the encoder
//! binary. [`ProcessEncoder`] spawns the binary with `tokio::process` and
//! races it against a [`CancellationToken`]; the child is killed when the
//! conversion is cancelled or times out.

use crate::encoder_args::EncoderArgs;
use crate::{Error, Result};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Captured outcome of a successful encoder run
#[derive(Debug, Clone, Default)]
pub struct EncoderOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Runs the external encoder for one argument vector
pub trait TextureEncoder: Send + Sync {
    /// Resolves once the encoder exits; non-zero exits are errors.
    fn encode(
        &self,
        args: &EncoderArgs,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<EncoderOutput>> + Send;
}

/// Encoder implemented by an executable on disk
#[derive(Debug, Clone)]
pub struct ProcessEncoder {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl TextureEncoder for ProcessEncoder {
    async fn encode(&self, args: &EncoderArgs, cancel: &CancellationToken) -> Result<EncoderOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!(
            program = %self.program.display(),
            args = %args.to_command_line(),
            "Spawning encoder"
        );

        let started = Instant::now();
        let child = Command::new(&self.program)
            .args(args.to_argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::EncoderSpawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Dropping this future drops the child, which kills it
        let wait = child.wait_with_output();
        let run = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result.map_err(Error::from),
                    Err(_) => Err(Error::Other(format!(
                        "Encoder timed out after {}s",
                        limit.as_secs_f32()
                    ))),
                },
                None => wait.await.map_err(Error::from),
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(program = %self.program.display(), "Encoder cancelled");
                return Err(Error::Cancelled);
            }
            result = run => result?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let diagnostics = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Encoder {
                code: output.status.code(),
                output: diagnostics,
            });
        }

        let elapsed = started.elapsed();
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Encoder finished");
        Ok(EncoderOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let encoder = ProcessEncoder::new("/definitely/not/an/encoder");
        let err = encoder
            .encode(&EncoderArgs::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EncoderSpawn { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_never_spawns() {
        let encoder = ProcessEncoder::new("/definitely/not/an/encoder");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = encoder
            .encode(&EncoderArgs::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_keeps_diagnostics() {
        let encoder = ProcessEncoder::new("false");
        let err = encoder
            .encode(&EncoderArgs::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encoder { code: Some(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_slow_encoder() {
        // `sleep` takes its duration from argv, so drive it through a script
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let encoder = ProcessEncoder::new(&script).with_timeout(Some(Duration::from_millis(100)));
        let err = encoder
            .encode(&EncoderArgs::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_while_running_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = ProcessEncoder::new(&script)
            .encode(&EncoderArgs::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
