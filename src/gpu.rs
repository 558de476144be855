//! GPU status snapshots from `nvidia-smi`.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{MonitorError, Result};
use crate::host::HostTarget;
use crate::session::{self, CaptureLimits};
use crate::transport::Transport;

/// Fixed-column query: index, name, temperature, utilization, memory used,
/// memory total. No header, no units.
pub const GPU_QUERY: &str = "nvidia-smi --query-gpu=index,name,temperature.gpu,\
                             utilization.gpu,memory.used,memory.total \
                             --format=csv,noheader,nounits";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuReading {
    pub index: u32,
    pub name: String,
    /// Degrees Celsius.
    pub temp: i64,
    /// Percent, 0-100.
    pub util: i64,
    /// MiB.
    pub mem_used: i64,
    /// MiB.
    pub mem_total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub util_avg: i64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub mem_pct: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    pub gpus: Vec<GpuReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostStatus {
    pub fn from_gpus(host: &str, gpus: Vec<GpuReading>) -> Self {
        let summary = summarize(&gpus);
        Self {
            host: host.to_string(),
            ok: true,
            summary,
            gpus,
            error: None,
        }
    }

    pub fn failed(host: &str, error: impl ToString) -> Self {
        Self {
            host: host.to_string(),
            ok: false,
            summary: None,
            gpus: vec![],
            error: Some(error.to_string()),
        }
    }
}

/// Integer part of a numeric field, tolerating decimal formatting.
fn truncated(field: &str) -> Option<i64> {
    let value: f64 = field.parse().ok()?;
    value.is_finite().then_some(value.trunc() as i64)
}

fn parse_row(line: &str) -> Option<GpuReading> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        return None;
    }
    Some(GpuReading {
        index: u32::try_from(truncated(fields[0])?).ok()?,
        name: fields[1].to_string(),
        temp: truncated(fields[2])?,
        util: truncated(fields[3])?,
        mem_used: truncated(fields[4])?,
        mem_total: truncated(fields[5])?,
    })
}

/// Parses the query output. Rows with too few fields or non-numeric values
/// are skipped.
pub fn parse_gpu_csv(text: &str) -> Result<Vec<GpuReading>> {
    let text = text.trim();
    if text.is_empty() {
        return Err(MonitorError::NoData);
    }
    let gpus: Vec<GpuReading> = text.lines().filter_map(parse_row).collect();
    if gpus.is_empty() {
        return Err(MonitorError::Unparsable);
    }
    Ok(gpus)
}

/// Aggregate figures for a non-empty GPU list.
pub fn summarize(gpus: &[GpuReading]) -> Option<Summary> {
    if gpus.is_empty() {
        return None;
    }
    let count = gpus.len();
    let util_avg = (gpus.iter().map(|gpu| gpu.util).sum::<i64>() as f64 / count as f64).round();
    let mem_used: i64 = gpus.iter().map(|gpu| gpu.mem_used).sum();
    let mem_total: i64 = gpus.iter().map(|gpu| gpu.mem_total).sum();
    let mem_pct = if mem_total == 0 {
        0
    } else {
        (100.0 * mem_used as f64 / mem_total as f64).round() as i64
    };
    Some(Summary {
        count,
        util_avg: util_avg as i64,
        mem_used,
        mem_total,
        mem_pct,
    })
}

/// Queries one host. Never fails: errors land in `HostStatus::error`.
pub async fn query_status(
    transport: &dyn Transport,
    host: &HostTarget,
    settings: &Settings,
) -> HostStatus {
    debug!("{} querying GPU status", host);
    match try_query_status(transport, host, settings).await {
        Ok(gpus) => HostStatus::from_gpus(&host.alias, gpus),
        Err(e) => {
            warn!("{} status failed: {}", host, e);
            HostStatus::failed(&host.alias, e)
        }
    }
}

async fn try_query_status(
    transport: &dyn Transport,
    host: &HostTarget,
    settings: &Settings,
) -> Result<Vec<GpuReading>> {
    let output = session::run(
        transport.exec(host, GPU_QUERY),
        None,
        CaptureLimits::uniform(settings.output_cap),
        settings.timeouts.status,
    )
    .await?;
    if !output.success() {
        return Err(output.exit_error());
    }
    parse_gpu_csv(&output.stdout.render_all())
}
