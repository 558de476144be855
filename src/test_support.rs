//! Transports that run on the local machine, for unit tests.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::host::HostTarget;
use crate::transport::Transport;

/// Runs the remote command with the local `sh`, as sshd would.
#[derive(Default)]
pub struct LocalTransport {
    /// Searched before the inherited `PATH`, to shadow remote tools.
    path_prefix: Option<PathBuf>,
}

impl LocalTransport {
    pub fn with_path_prefix(dir: &Path) -> Self {
        Self {
            path_prefix: Some(dir.to_path_buf()),
        }
    }
}

impl Transport for LocalTransport {
    fn exec(&self, _host: &HostTarget, remote_command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(remote_command);
        if let Some(dir) = &self.path_prefix {
            let mut path = OsString::from(dir);
            if let Some(inherited) = std::env::var_os("PATH") {
                path.push(":");
                path.push(inherited);
            }
            cmd.env("PATH", path);
        }
        cmd
    }

    fn batch_transfer(&self, _host: &HostTarget) -> Command {
        // Understands exactly one `get "src" "dst"` line.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"read -r line; eval "set -- $line"; [ "$1" = get ] && cp -- "$2" "$3""#);
        cmd
    }
}

/// Ignores the remote command and runs a fixed script instead, after
/// draining stdin.
pub struct ScriptTransport {
    script: String,
}

impl ScriptTransport {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("cat >/dev/null; {}", self.script));
        cmd
    }
}

impl Transport for ScriptTransport {
    fn exec(&self, _host: &HostTarget, _remote_command: &str) -> Command {
        self.command()
    }

    fn batch_transfer(&self, _host: &HostTarget) -> Command {
        self.command()
    }
}
