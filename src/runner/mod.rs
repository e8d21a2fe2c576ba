//! Build command execution.
//!
//! The build command runs under `/bin/bash -c` with the clone directory as
//! its working directory. Output is line-streamed into the build's
//! [`BuildLog`] as it arrives, so the periodic flusher and failure tails
//! see partial output from a command that is still running.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub mod log;

pub use log::{spawn_flusher, BuildLog, FsLogSink, LogSink};

/// Failure of the spawned build command.
///
/// The attached log tail is what notifiers show next to the error message.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Command \"{command}\" failed with code {code}")]
    CommandFailed {
        command: String,
        code: i32,
        log_tail: String,
    },

    #[error("Command \"{command}\" timed out after {seconds} seconds")]
    TimedOut {
        command: String,
        seconds: u64,
        log_tail: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// The captured log tail, when this failure carries one.
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            RunError::CommandFailed { log_tail, .. } | RunError::TimedOut { log_tail, .. } => {
                Some(log_tail)
            }
            RunError::Io(_) => None,
        }
    }
}

/// Runs the build command to completion.
///
/// The process environment is not inherited: the command sees exactly the
/// resolved pairs over a minimal floor (`PATH`, `HOME`, `SHELL`, `TERM`).
/// Non-zero exit and timeout both surface as build failures carrying the
/// current log tail.
pub async fn run_command(
    cmd: &str,
    workdir: &Path,
    env: &[(String, String)],
    timeout: Option<Duration>,
    log: Arc<BuildLog>,
) -> Result<(), RunError> {
    log.push(format!("$ {cmd}"));
    tracing::info!(command = %cmd, dir = %workdir.display(), "running build command");

    let mut child = tokio::process::Command::new("/bin/bash")
        .arg("-c")
        .arg(cmd)
        .current_dir(workdir)
        .env_clear()
        .envs(base_env())
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_pump = stdout.map(|out| tokio::spawn(pump(out, Arc::clone(&log), false)));
    let err_pump = stderr.map(|err| tokio::spawn(pump(err, Arc::clone(&log), true)));

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill().await;
                drain(out_pump, err_pump).await;
                return Err(RunError::TimedOut {
                    command: cmd.to_string(),
                    seconds: limit.as_secs(),
                    log_tail: log.tail(),
                });
            }
        },
        None => child.wait().await?,
    };

    drain(out_pump, err_pump).await;

    if status.success() {
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        tracing::warn!(command = %cmd, code, "build command failed");
        Err(RunError::CommandFailed {
            command: cmd.to_string(),
            code,
            log_tail: log.tail(),
        })
    }
}

/// Minimal environment floor under the resolved pairs, so `bash` can find
/// binaries without the build inheriting the whole process environment.
fn base_env() -> Vec<(String, String)> {
    vec![
        ("SHELL".to_string(), "/bin/bash".to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        (
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        ),
        (
            "HOME".to_string(),
            std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()),
        ),
    ]
}

async fn pump(reader: impl AsyncRead + Unpin + Send + 'static, log: Arc<BuildLog>, stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stderr {
                    tracing::warn!(line = %line, "build stderr");
                }
                log.push(line);
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "build output stream error");
                break;
            }
        }
    }
}

type Pump = Option<tokio::task::JoinHandle<()>>;

/// Waits for the output pumps so tails computed afterwards include the
/// command's final lines.
async fn drain(out: Pump, err: Pump) {
    if let Some(handle) = out {
        let _ = handle.await;
    }
    if let Some(handle) = err {
        let _ = handle.await;
    }
}
