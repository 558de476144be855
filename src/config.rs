//! Configuration for gpumon.
//!
//! `Config` holds the clap structs for command line arguments and flags.
//! `Settings` is the explicit configuration value the library components are
//! constructed with; the binary converts one into the other.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::completion::CompletionMode;

#[derive(Parser)]
#[command(version, about)]
pub struct Config {
    #[command(subcommand)]
    pub mode: Mode,

    /// SSH client config used for host aliases and connection options
    #[arg(long, global = true, env = "SSH_CONFIG_PATH")]
    pub ssh_config: Option<PathBuf>,

    /// YAML host file; takes precedence over the SSH config host list
    #[arg(long, global = true)]
    pub hosts_file: Option<PathBuf>,

    /// Control socket path; enables connection reuse when set
    #[arg(long, global = true, env = "SSH_CONTROL_PATH")]
    pub control_path: Option<String>,

    /// How long an idle reused connection stays open
    #[arg(long, global = true, env = "SSH_CONTROL_PERSIST", default_value = "60s")]
    pub control_persist: String,

    /// User for hosts that have none in the inventory
    #[arg(long, global = true, env = "GPUMON_DEFAULT_USER")]
    pub default_user: Option<String>,

    /// Byte cap for captured stdout/stderr
    #[arg(long, global = true, default_value_t = DEFAULT_OUTPUT_CAP)]
    pub output_cap: usize,

    /// Timeout for general commands, in seconds
    #[arg(long, global = true, default_value_t = 60)]
    pub command_timeout: u64,

    /// Verbose logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Mode {
    /// List the hosts in the inventory
    Hosts,
    /// GPU status for the given hosts (all inventory hosts if none)
    Status { hosts: Vec<String> },
    /// Compute processes running on one GPU of a host
    Procs { host: String, index: u32 },
    /// Run a shell command on a host
    Exec {
        host: String,
        command: String,
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Shell completions for a prefix
    Complete {
        host: String,
        prefix: String,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, value_enum, default_value = "file")]
        mode: CompletionMode,
    },
    /// Upload a local file to a remote path
    Upload {
        host: String,
        local: PathBuf,
        remote: String,
    },
    /// Download a remote file to a local path
    Download {
        host: String,
        remote: String,
        local: PathBuf,
    },
}

pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_COMPLETION_CAP: usize = 200;
pub const DEFAULT_POOL_WIDTH: usize = 8;

/// Timeout budgets, one per kind of remote operation.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Completion queries. Short and fixed.
    pub complete: Duration,
    /// General command execution.
    pub command: Duration,
    /// GPU status and process queries.
    pub status: Duration,
    /// Uploads and downloads.
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            complete: Duration::from_secs(10),
            command: Duration::from_secs(60),
            status: Duration::from_secs(30),
            transfer: Duration::from_secs(3600),
        }
    }
}

/// Multiplexed connection reuse through a control socket.
#[derive(Debug, Clone)]
pub struct ReuseSettings {
    pub control_path: String,
    /// Idle-persist window, in the transport's own syntax (e.g. `60s`).
    pub persist: String,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ssh_program: String,
    pub sftp_program: String,
    pub config_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub default_user: Option<String>,
    pub reuse: Option<ReuseSettings>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sftp_program: "sftp".to_string(),
            config_file: None,
            connect_timeout: Duration::from_secs(10),
            default_user: None,
            reuse: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub timeouts: Timeouts,
    /// Byte cap applied to captured stdout and stderr.
    pub output_cap: usize,
    /// Upload chunk size.
    pub chunk_size: usize,
    /// Maximum number of completion matches returned.
    pub completion_cap: usize,
    /// Upper bound on concurrent hosts during fan-out.
    pub pool_width: usize,
    pub transport: TransportSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            output_cap: DEFAULT_OUTPUT_CAP,
            chunk_size: DEFAULT_CHUNK_SIZE,
            completion_cap: DEFAULT_COMPLETION_CAP,
            pool_width: DEFAULT_POOL_WIDTH,
            transport: TransportSettings::default(),
        }
    }
}

impl From<&Config> for Settings {
    fn from(cli: &Config) -> Self {
        // Control sockets are Unix-domain sockets.
        let reuse = if cfg!(unix) {
            cli.control_path.as_ref().map(|path| ReuseSettings {
                control_path: path.clone(),
                persist: cli.control_persist.clone(),
            })
        } else {
            None
        };
        let mut settings = Settings {
            output_cap: cli.output_cap,
            transport: TransportSettings {
                config_file: cli.ssh_config.clone(),
                default_user: cli.default_user.clone(),
                reuse,
                ..TransportSettings::default()
            },
            ..Settings::default()
        };
        settings.timeouts.command = Duration::from_secs(cli.command_timeout);
        settings
    }
}
