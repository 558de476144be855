//! Marker framing: recovering the exit code and ending working directory of
//! a remote command from the tail of its standard output.
//!
//! The wrapped command runs under a login shell whose EXIT trap prints a
//! trailer after everything the command itself printed:
//!
//! ```text
//! stdout  = <command output> "\n" marker code "|" cwd "\n"
//! marker  = "__GPUMON_" 32 hex digits "__"   (fresh per invocation)
//! code    = decimal exit status of the command
//! cwd     = working directory when the command finished
//! ```
//!
//! The last occurrence of the marker wins, so a command printing the marker
//! text itself cannot forge a trailer. Standard error is never scanned.

use memchr::memmem;
use uuid::Uuid;

use crate::capture::Captured;
use crate::transport::sh_quote;

/// Bytes of stdout kept past the output cap so the trailer survives
/// truncation. Enough for the marker, an exit code and a long path.
pub const TRAILER_WINDOW: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    pub fn random() -> Self {
        Self(format!("__GPUMON_{}__", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    pub exit_code: i32,
    pub cwd: String,
}

/// Stdout split into the command's own output and the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    /// End of the command's own output within `Captured::bytes`.
    pub output_end: usize,
    pub trailer: Option<Trailer>,
}

#[derive(Debug, Clone)]
pub struct MarkerFramer {
    marker: Marker,
}

impl Default for MarkerFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerFramer {
    pub fn new() -> Self {
        Self::with_marker(Marker::random())
    }

    pub fn with_marker(marker: Marker) -> Self {
        Self { marker }
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// The shell script executed on the remote host.
    pub fn script(&self, command: &str, working_dir: Option<&str>) -> String {
        let cd = match working_dir.filter(|dir| !dir.is_empty()) {
            Some(dir) => format!("cd -- {} && ", sh_quote(dir)),
            None => String::new(),
        };
        format!(
            "__gpumon_trailer() {{ __gpumon_rc=$?; printf '\\n%s%s|%s\\n' '{marker}' \"$__gpumon_rc\" \"$(pwd)\"; }}\n\
             trap __gpumon_trailer EXIT\n\
             {cd}{command}\n",
            marker = self.marker.as_str(),
        )
    }

    /// The remote command line: the script under a login shell, so profile
    /// environment and aliases apply.
    pub fn remote_command(&self, command: &str, working_dir: Option<&str>) -> String {
        format!("bash -lc {}", sh_quote(&self.script(command, working_dir)))
    }

    /// Locates the trailer in captured stdout.
    pub fn parse(&self, captured: &Captured) -> Framed {
        let from = captured.searchable_from();
        let haystack = &captured.bytes[from..];
        let marker = self.marker.as_str().as_bytes();
        let pos = match memmem::rfind(haystack, marker) {
            Some(pos) => from + pos,
            None => {
                return Framed {
                    output_end: captured.bytes.len(),
                    trailer: None,
                }
            }
        };
        // The trailer starts with a newline of its own.
        let output_end = if pos > 0 && captured.bytes[pos - 1] == b'\n' {
            pos - 1
        } else {
            pos
        };
        let rest = &captured.bytes[pos + marker.len()..];
        let line = match memchr::memchr(b'\n', rest) {
            Some(end) => &rest[..end],
            None => rest,
        };
        let line = String::from_utf8_lossy(line);
        let trailer = line.split_once('|').and_then(|(code, cwd)| {
            code.trim().parse::<i32>().ok().map(|exit_code| Trailer {
                exit_code,
                cwd: cwd.trim_end_matches('\r').to_string(),
            })
        });
        Framed {
            output_end,
            trailer,
        }
    }
}
