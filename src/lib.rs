//! gpumon: agentless GPU monitoring and light administration over SSH.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to resolve and represent hosts.
pub mod host;
// ssh/sftp invocations.
pub mod transport;
// Bounded output capture.
pub mod capture;
// One subprocess, run under a timeout.
pub mod session;
// Exit code and cwd recovery from stdout.
pub mod framer;
// Remote command execution.
pub mod exec;
// nvidia-smi status snapshots.
pub mod gpu;
// Compute processes per GPU.
pub mod procs;
// Multi-host fan-out.
pub mod aggregator;
// Shell completion.
pub mod completion;
// Uploads and downloads.
pub mod transfer;
// Operations facade.
pub mod monitor;

#[cfg(test)]
mod test_support;

pub use aggregator::ConcurrentStatusAggregator;
pub use completion::{CompletionMode, CompletionQuery, CompletionResult, CompletionService};
pub use config::{Config, Mode, ReuseSettings, Settings, Timeouts, TransportSettings};
pub use error::MonitorError;
pub use exec::{CommandInvocation, ExecutionResult, RemoteCommandExecutor};
pub use framer::{Marker, MarkerFramer};
pub use gpu::{GpuReading, HostStatus, Summary};
pub use host::{resolve_target, HostTarget, HostsFile, Inventory, SshConfigInventory};
pub use monitor::Monitor;
pub use procs::{GpuProcesses, HostProcesses, ProcessAttributor, ProcessEntry};
pub use transfer::{FileTransferManager, StagedDownload, TransferOutcome};
pub use transport::{SshTransport, Transport, TransportCommandBuilder};
