//! Remote-shell transport.
//!
//! Every remote operation is one short-lived `ssh` (or `sftp`) subprocess.
//! The `Transport` trait is the seam between the operations and the actual
//! binaries, so the operations can be driven by a local shell in tests.

use tokio::process::Command;

use crate::config::TransportSettings;
use crate::host::HostTarget;

pub trait Transport: Send + Sync {
    /// A command that runs `remote_command` on `host` through the remote shell.
    fn exec(&self, host: &HostTarget, remote_command: &str) -> Command;

    /// A batch-mode file transfer session with `host`. The batch script is
    /// written to the child's stdin.
    fn batch_transfer(&self, host: &HostTarget) -> Command;
}

/// Builds argument vectors for `ssh` and `sftp` invocations.
#[derive(Debug, Clone)]
pub struct TransportCommandBuilder {
    settings: TransportSettings,
}

impl TransportCommandBuilder {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Options shared by `ssh` and `sftp`.
    fn common_options(&self, host: &HostTarget) -> Vec<String> {
        let mut args = vec![];
        if let Some(config) = &self.settings.config_file {
            args.push("-F".to_string());
            args.push(config.display().to_string());
        }
        let mut options = vec![
            "BatchMode=yes".to_string(),
            format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            ),
            "ForwardAgent=no".to_string(),
            "ForwardX11=no".to_string(),
            "ClearAllForwardings=yes".to_string(),
        ];
        if let Some(reuse) = &self.settings.reuse {
            options.push("ControlMaster=auto".to_string());
            options.push(format!("ControlPersist={}", reuse.persist));
            options.push(format!("ControlPath={}", reuse.control_path));
        }
        if let Some(user) = self.user_for(host) {
            options.push(format!("User={}", user));
        }
        for option in options {
            args.push("-o".to_string());
            args.push(option);
        }
        args
    }

    fn user_for<'a>(&'a self, host: &'a HostTarget) -> Option<&'a str> {
        host.user
            .as_deref()
            .or(self.settings.default_user.as_deref())
            .filter(|user| !user.is_empty())
    }

    /// Arguments for `ssh` running `remote_command` on `host`.
    pub fn ssh_args(&self, host: &HostTarget, remote_command: &str) -> Vec<String> {
        let mut args = self.common_options(host);
        // No agent, X11 or tty.
        args.extend(["-a", "-x", "-T"].map(String::from));
        args.push("--".to_string());
        args.push(host.alias.clone());
        args.push(remote_command.to_string());
        args
    }

    /// Arguments for a batch `sftp` session reading its script from stdin.
    pub fn sftp_args(&self, host: &HostTarget) -> Vec<String> {
        let mut args = self.common_options(host);
        args.extend(["-q", "-b", "-"].map(String::from));
        args.push("--".to_string());
        args.push(host.alias.clone());
        args
    }
}

/// The production transport: the system `ssh` and `sftp` binaries.
#[derive(Debug, Clone)]
pub struct SshTransport {
    builder: TransportCommandBuilder,
}

impl SshTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            builder: TransportCommandBuilder::new(settings),
        }
    }
}

impl Transport for SshTransport {
    fn exec(&self, host: &HostTarget, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.builder.settings().ssh_program);
        cmd.args(self.builder.ssh_args(host, remote_command));
        cmd
    }

    fn batch_transfer(&self, host: &HostTarget) -> Command {
        let mut cmd = Command::new(&self.builder.settings().sftp_program);
        cmd.args(self.builder.sftp_args(host));
        cmd
    }
}

/// Quotes `s` for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./,:@%+=".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quotes `s` for an sftp batch script line.
pub fn sftp_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', r"\\").replace('"', "\\\""))
}
