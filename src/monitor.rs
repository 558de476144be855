//! The operations offered to a front-end, bundled behind one value.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::aggregator::ConcurrentStatusAggregator;
use crate::completion::{CompletionQuery, CompletionResult, CompletionService};
use crate::config::Settings;
use crate::exec::{CommandInvocation, ExecutionResult, RemoteCommandExecutor};
use crate::gpu::{query_status, HostStatus};
use crate::host::HostTarget;
use crate::procs::{GpuProcesses, HostProcesses, ProcessAttributor};
use crate::transfer::{upload_destination, FileTransferManager, StagedDownload, TransferOutcome};
use crate::transport::{SshTransport, Transport};

pub struct Monitor {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    aggregator: ConcurrentStatusAggregator,
    executor: RemoteCommandExecutor,
    completion: CompletionService,
    transfers: FileTransferManager,
}

impl Monitor {
    /// A monitor talking to hosts through the system `ssh` and `sftp`.
    pub fn new(settings: Settings) -> Self {
        let transport = Arc::new(SshTransport::new(settings.transport.clone()));
        Self::with_transport(settings, transport)
    }

    pub fn with_transport(settings: Settings, transport: Arc<dyn Transport>) -> Self {
        Self {
            aggregator: ConcurrentStatusAggregator::new(settings.pool_width),
            executor: RemoteCommandExecutor::new(Arc::clone(&transport), settings.output_cap),
            completion: CompletionService::new(
                Arc::clone(&transport),
                settings.timeouts.complete,
                settings.completion_cap,
                settings.output_cap,
            ),
            transfers: FileTransferManager::new(Arc::clone(&transport), settings.clone()),
            settings: Arc::new(settings),
            transport,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// GPU status of one host.
    pub async fn status(&self, host: &HostTarget) -> HostStatus {
        query_status(&*self.transport, host, &self.settings).await
    }

    /// GPU status of many hosts, in the order given.
    pub async fn statuses(&self, hosts: &[HostTarget]) -> Vec<HostStatus> {
        let transport = Arc::clone(&self.transport);
        let settings = Arc::clone(&self.settings);
        self.aggregator
            .aggregate(
                hosts,
                move |host| {
                    let transport = Arc::clone(&transport);
                    let settings = Arc::clone(&settings);
                    async move { query_status(&*transport, &host, &settings).await }
                },
                |host, error| HostStatus::failed(&host.alias, error),
            )
            .await
    }

    /// Compute processes on GPU `index` of one host.
    pub async fn processes(&self, host: &HostTarget, index: u32) -> GpuProcesses {
        ProcessAttributor::new(&*self.transport, &self.settings)
            .gpu_processes(host, index)
            .await
    }

    /// Compute processes on GPU `index` of many hosts, in the order given.
    pub async fn processes_all(&self, hosts: &[HostTarget], index: u32) -> Vec<GpuProcesses> {
        let transport = Arc::clone(&self.transport);
        let settings = Arc::clone(&self.settings);
        self.aggregator
            .aggregate(
                hosts,
                move |host| {
                    let transport = Arc::clone(&transport);
                    let settings = Arc::clone(&settings);
                    async move {
                        ProcessAttributor::new(&*transport, &settings)
                            .gpu_processes(&host, index)
                            .await
                    }
                },
                |host, error| HostProcesses::failed(&host.alias, error).for_gpu(index),
            )
            .await
    }

    /// An invocation using the configured command timeout.
    pub fn invocation(
        &self,
        host: HostTarget,
        command: impl Into<String>,
        working_dir: Option<String>,
    ) -> CommandInvocation {
        CommandInvocation {
            host,
            command: command.into(),
            working_dir,
            timeout: self.settings.timeouts.command,
        }
    }

    pub async fn execute(&self, invocation: &CommandInvocation) -> ExecutionResult {
        self.executor.execute(invocation).await
    }

    pub async fn complete(&self, query: &CompletionQuery) -> CompletionResult {
        self.completion.complete(query).await
    }

    /// Uploads `total_length` bytes from `source`. When `remote_path` ends in
    /// `/`, `file_name` is appended to it.
    pub async fn upload<R>(
        &self,
        host: &HostTarget,
        remote_path: &str,
        file_name: Option<&str>,
        source: R,
        total_length: u64,
    ) -> TransferOutcome
    where
        R: AsyncRead + Unpin,
    {
        let destination = upload_destination(remote_path, file_name);
        self.transfers
            .upload(host, &destination, source, total_length)
            .await
    }

    pub async fn download(
        &self,
        host: &HostTarget,
        remote_path: &str,
    ) -> Result<StagedDownload, TransferOutcome> {
        self.transfers
            .download(host, remote_path)
            .await
            .map_err(|e| TransferOutcome::failed(&e))
    }
}
