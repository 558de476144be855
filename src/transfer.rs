//! Streaming uploads and staged downloads.
//!
//! Uploads pipe the source into a remote shell that writes a temporary file
//! and only renames it into place once the byte count matches the declared
//! length, so an interrupted upload never leaves a file that looks complete.
//!
//! Downloads run a batch `get` into a fresh local temporary directory. The
//! returned `StagedDownload` owns that directory and removes it exactly once,
//! when it is closed or dropped, however much of it was read.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::capture::OutputCapture;
use crate::config::Settings;
use crate::error::{MonitorError, Result};
use crate::host::HostTarget;
use crate::session::{self, program_name, CaptureLimits};
use crate::transport::{sftp_quote, sh_quote, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub ok: bool,
    /// Bytes moved.
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn done(bytes: u64) -> Self {
        Self {
            ok: true,
            bytes,
            error: None,
        }
    }

    pub fn failed(error: &MonitorError) -> Self {
        Self {
            ok: false,
            bytes: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Shell expression for a remote path. A leading `~/` stays expandable.
fn remote_path_expr(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", sh_quote(rest)),
        None => sh_quote(path),
    }
}

/// Where an upload lands: a path ending in `/` is a directory, and the
/// file keeps its own name.
pub fn upload_destination(remote_path: &str, file_name: Option<&str>) -> String {
    match file_name.filter(|name| !name.is_empty()) {
        Some(name) if remote_path.ends_with('/') => {
            // Only the last component of a client-supplied name.
            let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
            format!("{}{}", remote_path, name)
        }
        _ => remote_path.to_string(),
    }
}

/// Remote side of an upload: write to a sibling temporary file, check the
/// size, then rename over the destination.
fn upload_script(destination: &str, expected: u64) -> String {
    let dest = remote_path_expr(destination);
    format!(
        "t={dest}.gpumon-part-$$; \
         if cat > \"$t\" && [ \"$(($(wc -c < \"$t\")))\" -eq {expected} ]; then mv -f -- \"$t\" {dest}; \
         else rm -f -- \"$t\"; echo 'upload incomplete; nothing written' >&2; exit 1; fi"
    )
}

/// Which side of the upload pump gave out.
enum PumpFailure {
    /// Reading the caller's byte source.
    Source(io::Error),
    /// Writing into the remote command's stdin.
    Sink(io::Error),
}

impl PumpFailure {
    fn describe(&self) -> String {
        match self {
            PumpFailure::Source(e) => format!("client disconnected: {}", e),
            PumpFailure::Sink(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                "remote end closed the stream".to_string()
            }
            PumpFailure::Sink(e) => e.to_string(),
        }
    }
}

pub struct FileTransferManager {
    transport: Arc<dyn Transport>,
    settings: Settings,
}

impl FileTransferManager {
    pub fn new(transport: Arc<dyn Transport>, settings: Settings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Streams `total_length` bytes from `source` to `remote_path` on `host`.
    pub async fn upload<R>(
        &self,
        host: &HostTarget,
        remote_path: &str,
        source: R,
        total_length: u64,
    ) -> TransferOutcome
    where
        R: AsyncRead + Unpin,
    {
        info!("{} upload {} ({} bytes)", host, remote_path, total_length);
        match self.try_upload(host, remote_path, source, total_length).await {
            Ok(sent) => {
                info!("{} upload of {} complete", host, remote_path);
                TransferOutcome::done(sent)
            }
            Err(e) => {
                warn!("{} upload of {} failed: {}", host, remote_path, e);
                TransferOutcome::failed(&e)
            }
        }
    }

    async fn try_upload<R>(
        &self,
        host: &HostTarget,
        remote_path: &str,
        mut source: R,
        total_length: u64,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut cmd = self
            .transport
            .exec(host, &upload_script(remote_path, total_length));
        let program = program_name(&cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|source| MonitorError::Spawn { program, source })?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let mut diagnostics = OutputCapture::new(self.settings.output_cap, 0);
        let chunk_size = self.settings.chunk_size.max(1);

        let transfer = async {
            // Owns the pipe; every exit path drops it, signalling end of data.
            let pump = async {
                let Some(mut pipe) = stdin else {
                    return Ok(0);
                };
                let mut sent = 0u64;
                let mut buf = vec![0u8; chunk_size];
                while sent < total_length {
                    let want = (total_length - sent).min(chunk_size as u64) as usize;
                    let n = source
                        .read(&mut buf[..want])
                        .await
                        .map_err(PumpFailure::Source)?;
                    if n == 0 {
                        break;
                    }
                    pipe.write_all(&buf[..n]).await.map_err(PumpFailure::Sink)?;
                    sent += n as u64;
                }
                Ok::<_, PumpFailure>(sent)
            };
            let read_err = async {
                match stderr {
                    Some(pipe) => diagnostics.read_from(pipe).await,
                    None => Ok(()),
                }
            };
            let (pumped, _) = futures::future::join(pump, read_err).await;
            let status = child.wait().await?;
            Ok::<_, MonitorError>((pumped, status))
        };

        let outcome = tokio::time::timeout(self.settings.timeouts.transfer, transfer).await;
        let (pumped, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(MonitorError::TimedOut);
            }
        };
        let diagnostics = diagnostics.finish().render_all();
        let diagnostics = diagnostics.trim();
        let sent = match pumped {
            Ok(sent) => sent,
            // The remote refused the data and exited with its own verdict.
            Err(PumpFailure::Sink(e))
                if e.kind() == io::ErrorKind::BrokenPipe
                    && status.code().map_or(false, |code| code != 0) =>
            {
                return Err(MonitorError::RemoteRejected(
                    MonitorError::exited(status.code(), diagnostics, "").to_string(),
                ));
            }
            Err(failure) => {
                let reason = failure.describe();
                return Err(MonitorError::Interrupted(if diagnostics.is_empty() {
                    reason
                } else {
                    format!("{} ({})", reason, diagnostics)
                }));
            }
        };
        debug!("{} sent {} of {} bytes", host, sent, total_length);
        if sent < total_length {
            return Err(MonitorError::ShortTransfer {
                sent,
                expected: total_length,
            });
        }
        if !status.success() {
            return Err(MonitorError::RemoteRejected(
                MonitorError::exited(status.code(), diagnostics, "").to_string(),
            ));
        }
        Ok(sent)
    }

    /// Fetches `remote_path` from `host` into a private staging directory.
    /// On failure nothing is left behind.
    pub async fn download(&self, host: &HostTarget, remote_path: &str) -> Result<StagedDownload> {
        info!("{} download {}", host, remote_path);
        let staging = tempfile::Builder::new().prefix("gpumon-dl-").tempdir()?;
        let local = staging.path().join("payload");
        let batch = format!(
            "get {} {}\n",
            sftp_quote(remote_path),
            sftp_quote(&local.to_string_lossy())
        );
        let output = session::run(
            self.transport.batch_transfer(host),
            Some(batch.as_bytes()),
            CaptureLimits::uniform(self.settings.output_cap),
            self.settings.timeouts.transfer,
        )
        .await
        .map_err(|e| {
            warn!("{} download of {} failed: {}", host, remote_path, e);
            e
        })?;
        if !output.success() {
            let e = output.exit_error();
            warn!("{} download of {} failed: {}", host, remote_path, e);
            return Err(e);
        }
        // The staged file is the only size that counts.
        let file = File::open(&local).await.map_err(|_| {
            MonitorError::RemoteRejected(format!("{} was not transferred", remote_path))
        })?;
        let len = file.metadata().await?.len();
        info!("{} staged {} ({} bytes)", host, remote_path, len);
        Ok(StagedDownload {
            file,
            len,
            path: local,
            staging: Some(staging),
        })
    }
}

/// A downloaded file waiting to be streamed out. Reading it yields the file
/// contents; dropping or closing it removes the staging directory.
#[derive(Debug)]
pub struct StagedDownload {
    file: File,
    len: u64,
    path: PathBuf,
    staging: Option<TempDir>,
}

impl StagedDownload {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_ref().map(TempDir::path)
    }

    /// Streams the whole file into `writer`, then cleans up. Cleanup also
    /// happens when the copy fails part way.
    pub async fn stream_to<W>(mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let copied = tokio::io::copy(&mut self, writer).await;
        let flushed = match copied {
            Ok(n) => writer.flush().await.map(|_| n),
            Err(e) => Err(e),
        };
        let closed = self.close();
        let n = flushed?;
        closed?;
        Ok(n)
    }

    /// Removes the staging directory now, reporting any error.
    pub fn close(mut self) -> io::Result<()> {
        match self.staging.take() {
            Some(staging) => staging.close(),
            None => Ok(()),
        }
    }
}

impl AsyncRead for StagedDownload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}
