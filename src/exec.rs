//! Arbitrary shell commands on a single host.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::framer::{MarkerFramer, TRAILER_WINDOW};
use crate::host::HostTarget;
use crate::session::{self, CaptureLimits};
use crate::transport::Transport;

/// Exit status `ssh` reserves for its own failures.
const TRANSPORT_FAILURE_CODE: i32 = 255;

#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub host: HostTarget,
    pub command: String,
    pub working_dir: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Working directory the command ended in.
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(error: &MonitorError, cwd: String) -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            cwd,
            error: Some(error.to_string()),
        }
    }
}

pub struct RemoteCommandExecutor {
    transport: Arc<dyn Transport>,
    output_cap: usize,
}

impl RemoteCommandExecutor {
    pub fn new(transport: Arc<dyn Transport>, output_cap: usize) -> Self {
        Self {
            transport,
            output_cap,
        }
    }

    /// Runs the command to completion. Never fails: every failure is
    /// reported through `ExecutionResult::error`.
    pub async fn execute(&self, invocation: &CommandInvocation) -> ExecutionResult {
        let host = &invocation.host;
        let working_dir = invocation
            .working_dir
            .as_deref()
            .filter(|dir| !dir.is_empty());
        let requested_cwd = working_dir.unwrap_or_default().to_string();

        let framer = MarkerFramer::new();
        let remote = framer.remote_command(&invocation.command, working_dir);
        debug!("{} exec {:?}", host, invocation.command);

        let limits = CaptureLimits {
            stdout_cap: self.output_cap,
            stdout_tail: TRAILER_WINDOW,
            stderr_cap: self.output_cap,
        };
        let output = match session::run(
            self.transport.exec(host, &remote),
            None,
            limits,
            invocation.timeout,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("{} exec failed: {}", host, e);
                return ExecutionResult::failed(&e, requested_cwd);
            }
        };

        let framed = framer.parse(&output.stdout);
        let stdout = output.stdout.render(framed.output_end);
        let stderr = output.stderr.render_all();
        let (exit_code, cwd) = match framed.trailer {
            Some(trailer) => (Some(trailer.exit_code), trailer.cwd),
            None => {
                // Killed before the trailer printed, or the transport itself
                // failed; fall back to the transport's exit status.
                let code = output
                    .status
                    .code()
                    .filter(|code| *code != TRANSPORT_FAILURE_CODE);
                (code, requested_cwd)
            }
        };

        let error = if exit_code == Some(0) {
            None
        } else {
            let error = MonitorError::exited(exit_code.or(output.status.code()), &stderr, "");
            debug!("{} command failed: {}", host, error);
            Some(error.to_string())
        };
        ExecutionResult {
            ok: error.is_none(),
            exit_code,
            stdout,
            stderr,
            cwd,
            error,
        }
    }
}
