use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    TimedOut,
    /// The remote side (or the transport itself) exited unsuccessfully.
    /// `message` is its diagnostic text, or "exited with N" when it printed nothing.
    #[error("{message}")]
    Exited { code: Option<i32>, message: String },
    #[error("no data")]
    NoData,
    #[error("unable to parse output")]
    Unparsable,
    #[error("invalid process data: {0}")]
    InvalidProcessData(#[from] serde_json::Error),
    #[error("transfer interrupted: {0}")]
    Interrupted(String),
    #[error("transfer interrupted: sent {sent} of {expected} bytes")]
    ShortTransfer { sent: u64, expected: u64 },
    #[error("remote rejected transfer: {0}")]
    RemoteRejected(String),
    #[error("inventory error: {0}")]
    Inventory(String),
}

impl MonitorError {
    /// Builds an `Exited` error from captured diagnostics, falling back to the
    /// exit code when both streams are empty.
    pub fn exited(code: Option<i32>, stderr: &str, stdout: &str) -> Self {
        let text = if !stderr.trim().is_empty() {
            stderr.trim()
        } else {
            stdout.trim()
        };
        let message = if text.is_empty() {
            match code {
                Some(code) => format!("exited with {}", code),
                None => "terminated by signal".to_string(),
            }
        } else {
            text.to_string()
        };
        MonitorError::Exited { code, message }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MonitorError::TimedOut)
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;
