//! Compute processes per GPU.
//!
//! One remote round trip per host: a helper script joins the GPU UUID table
//! with the compute-process table and resolves each process's working
//! directory. Filtering by GPU index happens locally afterwards.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{MonitorError, Result};
use crate::host::HostTarget;
use crate::session::{self, CaptureLimits};
use crate::transport::Transport;

/// Starts whichever Python the host has and reads the helper from stdin.
const HELPER_LAUNCHER: &str =
    "sh -c 'command -v python3 >/dev/null 2>&1 && exec python3 - || exec python -'";

/// Remote helper. Prints a JSON array of process entries.
const HELPER_SCRIPT: &str = r#"
import json, os, subprocess, sys

def query(args):
    proc = subprocess.Popen(args, stdout=subprocess.PIPE, stderr=subprocess.PIPE)
    out, err = proc.communicate()
    out = out.decode("utf-8", "replace")
    if proc.returncode != 0:
        sys.stderr.write(err.decode("utf-8", "replace") or out)
        sys.exit(proc.returncode)
    return out.strip()

def rows(text, width):
    for line in text.splitlines():
        fields = [f.strip() for f in line.split(",")]
        if len(fields) >= width:
            yield fields[:width]

def number(text):
    try:
        return int(float(text))
    except ValueError:
        return None

try:
    gpus = query(["nvidia-smi", "--query-gpu=index,uuid", "--format=csv,noheader,nounits"])
    apps = query(["nvidia-smi", "--query-compute-apps=gpu_uuid,pid,process_name,used_memory",
                  "--format=csv,noheader,nounits"])
except OSError as exc:
    sys.stderr.write(str(exc))
    sys.exit(1)

if apps.lower().startswith("no running processes"):
    apps = ""

index_of = dict((uuid, index) for index, uuid in rows(gpus, 2))
entries = []
for uuid, pid, name, mem in rows(apps, 4):
    cwd, cwd_error = "", ""
    if pid.isdigit():
        try:
            cwd = os.readlink("/proc/%s/cwd" % pid)
        except OSError as exc:
            cwd_error = str(exc)
    index = index_of.get(uuid, "")
    entries.append({
        "gpu_index": int(index) if index.isdigit() else None,
        "pid": int(pid) if pid.isdigit() else None,
        "name": name,
        "mem_used": number(mem) if mem else None,
        "cwd": cwd,
        "cwd_error": cwd_error,
    })
print(json.dumps(entries))
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    #[serde(default)]
    pub gpu_index: Option<u32>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub name: String,
    /// MiB.
    #[serde(default)]
    pub mem_used: Option<u64>,
    #[serde(default)]
    pub cwd: String,
    /// Why `cwd` could not be resolved, if it could not.
    #[serde(default)]
    pub cwd_error: String,
}

/// All compute processes of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProcesses {
    pub host: String,
    pub ok: bool,
    pub processes: Vec<ProcessEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostProcesses {
    pub fn failed(host: &str, error: impl ToString) -> Self {
        Self {
            host: host.to_string(),
            ok: false,
            processes: vec![],
            error: Some(error.to_string()),
        }
    }

    /// Keeps only the processes attributed to GPU `index`.
    pub fn for_gpu(self, index: u32) -> GpuProcesses {
        GpuProcesses {
            host: self.host,
            ok: self.ok,
            index,
            processes: self
                .processes
                .into_iter()
                .filter(|entry| entry.gpu_index == Some(index))
                .collect(),
            error: self.error,
        }
    }
}

/// Compute processes of one GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcesses {
    pub host: String,
    pub ok: bool,
    pub index: u32,
    pub processes: Vec<ProcessEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parses the helper's output. Empty output and the "no running processes"
/// sentinel both mean zero processes.
pub fn parse_helper_output(text: &str) -> Result<Vec<ProcessEntry>> {
    let text = text.trim();
    if text.is_empty() || text.to_ascii_lowercase().starts_with("no running processes") {
        return Ok(vec![]);
    }
    Ok(serde_json::from_str(text)?)
}

pub struct ProcessAttributor<'a> {
    transport: &'a dyn Transport,
    settings: &'a Settings,
}

impl<'a> ProcessAttributor<'a> {
    pub fn new(transport: &'a dyn Transport, settings: &'a Settings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Every compute process on `host`. Never fails: errors land in
    /// `HostProcesses::error`.
    pub async fn host_processes(&self, host: &HostTarget) -> HostProcesses {
        debug!("{} querying compute processes", host);
        match self.try_host_processes(host).await {
            Ok(processes) => HostProcesses {
                host: host.alias.clone(),
                ok: true,
                processes,
                error: None,
            },
            Err(e) => {
                warn!("{} process query failed: {}", host, e);
                HostProcesses::failed(&host.alias, e)
            }
        }
    }

    /// Processes on GPU `index` of `host`.
    pub async fn gpu_processes(&self, host: &HostTarget, index: u32) -> GpuProcesses {
        self.host_processes(host).await.for_gpu(index)
    }

    async fn try_host_processes(&self, host: &HostTarget) -> Result<Vec<ProcessEntry>> {
        let output = session::run(
            self.transport.exec(host, HELPER_LAUNCHER),
            Some(HELPER_SCRIPT.as_bytes()),
            CaptureLimits::uniform(self.settings.output_cap),
            self.settings.timeouts.status,
        )
        .await?;
        if !output.success() {
            return Err(output.exit_error());
        }
        if output.stdout.skipped > 0 {
            return Err(MonitorError::Unparsable);
        }
        parse_helper_output(&String::from_utf8_lossy(&output.stdout.bytes))
    }
}
