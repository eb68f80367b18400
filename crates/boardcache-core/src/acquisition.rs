//! Acquisition runner
//!
//! Builds a board database by invoking the external `boardlib` tool:
//!
//! ```text
//! <program> <leading_args..> database <board> <output> [--username <user>]
//! ```
//!
//! The password is written to the tool's stdin followed by a newline and never
//! appears on the command line. The runner only reports what happened; it does
//! not inspect the output file.
//!
//! Board images go through the same tool:
//!
//! ```text
//! <program> <leading_args..> images <board> <database> <output_dir>
//! ```

use crate::cancel::CancelToken;
use crate::config::RunnerConfig;
use crate::models::{CacheKey, Credentials};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long output readers may keep draining after the tool is gone
///
/// A grandchild can hold the pipes open after the tool itself was killed.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Captured output of one tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// `None` when the tool never exited on its own (spawn failure, timeout, cancel)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Diagnostic {
    fn spawn_failure(message: String) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: message,
        }
    }

    /// Stdout and stderr joined, cut to at most `limit` characters
    pub fn render_truncated(&self, limit: usize) -> String {
        let mut text = String::new();
        if !self.stdout.is_empty() {
            text.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }

        match text.char_indices().nth(limit) {
            Some((cut, _)) => {
                text.truncate(cut);
                text.push_str("...");
                text
            }
            None => text,
        }
    }
}

/// One build: which board, as whom, into which file
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub key: &'a CacheKey,
    pub credentials: &'a Credentials,
    pub output: &'a Path,
}

/// One image download: which board, read from which database, into which directory
#[derive(Debug, Clone, Copy)]
pub struct ImagesRequest<'a> {
    pub key: &'a CacheKey,
    pub database: &'a Path,
    pub output_dir: &'a Path,
}

/// How a tool invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Tool exited with status 0
    Success(Diagnostic),
    /// Spawn failure, non-zero exit, or timeout
    Failure { reason: String, diagnostic: Diagnostic },
    /// The cancel token fired before the tool finished
    Cancelled,
}

/// Produces a board database file at a requested path
#[async_trait]
pub trait Runner: Send + Sync {
    async fn build(&self, request: &BuildRequest<'_>, cancel: &CancelToken) -> BuildOutcome;

    /// Download board images referenced by an existing database
    async fn fetch_images(
        &self,
        request: &ImagesRequest<'_>,
        _cancel: &CancelToken,
    ) -> BuildOutcome {
        let reason = format!("image download is not supported for {}", request.key);
        BuildOutcome::Failure {
            diagnostic: Diagnostic::spawn_failure(reason.clone()),
            reason,
        }
    }
}

/// Runs the `boardlib` CLI as a child process
#[derive(Debug, Clone, Default)]
pub struct BoardlibRunner {
    config: RunnerConfig,
}

impl BoardlibRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Full argument list after the program name
    pub fn command_args(&self, request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = self.config.leading_args.clone();
        args.push("database".to_string());
        args.push(request.key.as_str().to_string());
        args.push(request.output.to_string_lossy().into_owned());
        if let Some(username) = request.credentials.username() {
            args.push("--username".to_string());
            args.push(username.to_string());
        }
        args
    }

    pub fn images_args(&self, request: &ImagesRequest<'_>) -> Vec<String> {
        let mut args = self.config.leading_args.clone();
        args.push("images".to_string());
        args.push(request.key.as_str().to_string());
        args.push(request.database.to_string_lossy().into_owned());
        args.push(request.output_dir.to_string_lossy().into_owned());
        args
    }

    /// Spawn the tool, feed `password` on stdin, and wait under the timeout
    async fn run(
        &self,
        key: &CacheKey,
        args: &[String],
        password: Option<&str>,
        cancel: &CancelToken,
    ) -> BuildOutcome {
        if cancel.is_cancelled() {
            return BuildOutcome::Cancelled;
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if password.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        debug!(
            board = %key,
            program = %self.config.program.display(),
            subcommand = ?args.get(self.config.leading_args.len()),
            authenticated = password.is_some(),
            "Spawning acquisition tool"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!(
                    "failed to spawn {}: {}",
                    self.config.program.display(),
                    e
                );
                warn!(board = %key, error = %e, "Acquisition tool could not be started");
                return BuildOutcome::Failure {
                    diagnostic: Diagnostic::spawn_failure(reason.clone()),
                    reason,
                };
            }
        };

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        if let (Some(password), Some(mut stdin)) = (password, child.stdin.take()) {
            let fed = async {
                stdin.write_all(password.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            // A tool that exits before reading stdin surfaces through its exit status
            if let Err(e) = fed {
                debug!(board = %key, error = %e, "Failed to write password to stdin");
            }
        }

        let timeout = self.config.timeout;
        let waited = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait()) => match result {
                Ok(status) => Waited::Exited(status),
                Err(_) => Waited::TimedOut,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        if !matches!(waited, Waited::Exited(Ok(_))) {
            if let Err(e) = child.kill().await {
                debug!(board = %key, error = %e, "Failed to kill acquisition tool");
            }
        }

        match waited {
            Waited::Exited(Ok(status)) => {
                let diagnostic = Diagnostic {
                    exit_code: status.code(),
                    stdout: stdout.finish().await,
                    stderr: stderr.finish().await,
                };
                if status.success() {
                    BuildOutcome::Success(diagnostic)
                } else {
                    let reason = match diagnostic.exit_code {
                        Some(code) => format!("exited with status {}", code),
                        None => "terminated by signal".to_string(),
                    };
                    BuildOutcome::Failure { reason, diagnostic }
                }
            }
            Waited::Exited(Err(e)) => {
                stdout.abort();
                stderr.abort();
                let reason = format!("failed to wait for acquisition tool: {}", e);
                BuildOutcome::Failure {
                    diagnostic: Diagnostic::spawn_failure(reason.clone()),
                    reason,
                }
            }
            Waited::TimedOut => {
                warn!(board = %key, timeout = ?timeout, "Acquisition timed out");
                BuildOutcome::Failure {
                    reason: format!("timed out after {:?}", timeout),
                    diagnostic: Diagnostic {
                        exit_code: None,
                        stdout: stdout.finish().await,
                        stderr: stderr.finish().await,
                    },
                }
            }
            Waited::Cancelled => {
                stdout.abort();
                stderr.abort();
                debug!(board = %key, "Acquisition cancelled");
                BuildOutcome::Cancelled
            }
        }
    }
}

#[async_trait]
impl Runner for BoardlibRunner {
    async fn build(&self, request: &BuildRequest<'_>, cancel: &CancelToken) -> BuildOutcome {
        let args = self.command_args(request);
        self.run(request.key, &args, request.credentials.password(), cancel)
            .await
    }

    async fn fetch_images(
        &self,
        request: &ImagesRequest<'_>,
        cancel: &CancelToken,
    ) -> BuildOutcome {
        let args = self.images_args(request);
        self.run(request.key, &args, None, cancel).await
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Drains one child pipe into a shared buffer as bytes arrive
///
/// The buffer survives the reader, so whatever was printed before a timeout
/// is still available after the child is killed.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let sink = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).trim().to_string()
    }

    fn abort(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}
