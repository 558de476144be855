//! Path and command-name completion through the remote shell's `compgen`.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::host::HostTarget;
use crate::session::{self, CaptureLimits};
use crate::transport::{sh_quote, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    File,
    Command,
}

#[derive(Debug, Clone)]
pub struct CompletionQuery {
    pub host: HostTarget,
    pub prefix: String,
    pub working_dir: Option<String>,
    pub mode: CompletionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionResult {
    pub ok: bool,
    pub matches: Vec<String>,
    /// More matches existed than were returned.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The remote script for `query`. A failed `cd` fails the script; a prefix
/// with no matches does not.
fn completion_script(query: &CompletionQuery) -> String {
    let prefix = sh_quote(&query.prefix);
    let generate = match query.mode {
        // Directories get a trailing slash.
        CompletionMode::File => format!(
            "compgen -f -- {} | while IFS= read -r m; do \
             if [ -d \"$m\" ]; then printf '%s/\\n' \"$m\"; else printf '%s\\n' \"$m\"; fi; done",
            prefix
        ),
        CompletionMode::Command => format!("compgen -c -- {}", prefix),
    };
    match query.working_dir.as_deref().filter(|dir| !dir.is_empty()) {
        Some(dir) => format!("cd -- {} && {{ {} || true; }}", sh_quote(dir), generate),
        None => format!("{{ {} || true; }}", generate),
    }
}

/// Distinct non-empty lines in first-seen order, at most `cap` of them.
pub fn collect_matches(output: &str, cap: usize) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .unique()
        .take(cap)
        .map(str::to_string)
        .collect()
}

/// Longest prefix shared by every match.
pub fn common_prefix(matches: &[String]) -> &str {
    let Some(first) = matches.first() else {
        return "";
    };
    let mut len = first.len();
    for other in &matches[1..] {
        len = first
            .char_indices()
            .zip(other.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8())
            .min(len);
    }
    &first[..len]
}

pub struct CompletionService {
    transport: Arc<dyn Transport>,
    /// Fixed and short; completion must not hang an interactive prompt.
    timeout: Duration,
    cap: usize,
    output_cap: usize,
}

impl CompletionService {
    pub fn new(
        transport: Arc<dyn Transport>,
        timeout: Duration,
        cap: usize,
        output_cap: usize,
    ) -> Self {
        Self {
            transport,
            timeout,
            cap,
            output_cap,
        }
    }

    pub async fn complete(&self, query: &CompletionQuery) -> CompletionResult {
        match self.try_complete(query).await {
            Ok((matches, truncated)) => CompletionResult {
                ok: true,
                matches,
                truncated,
                error: None,
            },
            Err(e) => {
                warn!("{} completion failed: {}", query.host, e);
                CompletionResult {
                    ok: false,
                    matches: vec![],
                    truncated: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_complete(&self, query: &CompletionQuery) -> Result<(Vec<String>, bool)> {
        debug!("{} complete {:?} ({:?})", query.host, query.prefix, query.mode);
        // Command lookups want the login PATH.
        let shell = match query.mode {
            CompletionMode::File => "bash -c",
            CompletionMode::Command => "bash -lc",
        };
        let remote = format!("{} {}", shell, sh_quote(&completion_script(query)));
        let output = session::run(
            self.transport.exec(&query.host, &remote),
            None,
            CaptureLimits::uniform(self.output_cap),
            self.timeout,
        )
        .await?;
        if !output.success() {
            return Err(output.exit_error());
        }
        // Only whole lines count; a name cut at the byte cap is not a match.
        let (lines, cut) = output.stdout.whole_lines();
        let text = String::from_utf8_lossy(lines);
        let mut matches = collect_matches(&text, self.cap.saturating_add(1));
        let truncated = cut || matches.len() > self.cap;
        matches.truncate(self.cap);
        if truncated {
            debug!("{} completion list truncated at {}", query.host, matches.len());
        }
        Ok((matches, truncated))
    }
}
