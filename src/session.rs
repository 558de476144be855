//! One remote-shell session: a single transport subprocess, run to
//! completion under a hard wall-clock timeout.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::future::join3;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::capture::{Captured, OutputCapture};
use crate::error::{MonitorError, Result};

/// How much of each output stream to keep.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub stdout_cap: usize,
    /// Bytes kept from the end of stdout once the cap is exceeded.
    pub stdout_tail: usize,
    pub stderr_cap: usize,
}

impl CaptureLimits {
    pub fn uniform(cap: usize) -> Self {
        Self {
            stdout_cap: cap,
            stdout_tail: 0,
            stderr_cap: cap,
        }
    }
}

#[derive(Debug)]
pub struct SessionOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl SessionOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// The failure for a non-zero exit, with the session's own diagnostics.
    pub fn exit_error(&self) -> MonitorError {
        MonitorError::exited(
            self.status.code(),
            &self.stderr.render_all(),
            &self.stdout.render_all(),
        )
    }
}

pub(crate) fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Spawns `cmd`, writes `input` to its stdin (if any), captures stdout and
/// stderr, and waits for it to exit. On timeout the subprocess is killed.
pub async fn run(
    mut cmd: Command,
    input: Option<&[u8]>,
    limits: CaptureLimits,
    timeout: Duration,
) -> Result<SessionOutput> {
    let program = program_name(&cmd);
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|source| MonitorError::Spawn { program, source })?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut out = OutputCapture::new(limits.stdout_cap, limits.stdout_tail);
    let mut err = OutputCapture::new(limits.stderr_cap, 0);

    let io = async {
        let feed = async {
            match (stdin, input) {
                (Some(mut pipe), Some(data)) => {
                    let written = pipe.write_all(data).await;
                    // Dropping the pipe closes it, signalling end of input.
                    drop(pipe);
                    match written {
                        // The remote side may exit without reading everything.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                        other => other,
                    }
                }
                _ => Ok(()),
            }
        };
        let read_out = async {
            match stdout {
                Some(pipe) => out.read_from(pipe).await,
                None => Ok(()),
            }
        };
        let read_err = async {
            match stderr {
                Some(pipe) => err.read_from(pipe).await,
                None => Ok(()),
            }
        };
        let (fed, read_out, read_err) = join3(feed, read_out, read_err).await;
        fed?;
        read_out?;
        read_err?;
        child.wait().await
    };

    let outcome = tokio::time::timeout(timeout, io).await;
    match outcome {
        Ok(Ok(status)) => Ok(SessionOutput {
            status,
            stdout: out.finish(),
            stderr: err.finish(),
        }),
        Ok(Err(e)) => {
            let _ = child.start_kill();
            Err(MonitorError::Io(e))
        }
        Err(_) => {
            debug!("session exceeded {:?}, killing subprocess", timeout);
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(MonitorError::TimedOut)
        }
    }
}
