//! Hosts and where they come from.
//!
//! A `HostTarget` is resolved once per request from an `Inventory`. Two
//! inventories are provided: a YAML host file and the host aliases of an
//! OpenSSH client config.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use colored::*;
use colourado::Color;
use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::{MonitorError, Result};
use crate::serde::string_or_mapping;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostTarget {
    /// Host alias as understood by the remote-shell transport.
    pub alias: String,
    /// Login user. `None` lets the transport decide.
    pub user: Option<String>,
}

impl HostTarget {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "[{}@{}]", user, self.alias),
            None => write!(f, "[{}]", self.alias),
        }
    }
}

/// Source of host aliases and per-host users.
pub trait Inventory: Send + Sync {
    fn list_hosts(&self) -> Vec<String>;
    fn user_for(&self, alias: &str) -> Option<String>;
}

/// Resolves `alias` against the inventory, then the default user.
pub fn resolve_target(
    inventory: &dyn Inventory,
    alias: &str,
    default_user: Option<&str>,
) -> HostTarget {
    let user = inventory
        .user_for(alias)
        .filter(|user| !user.is_empty())
        .or_else(|| default_user.map(str::to_string));
    HostTarget {
        alias: alias.to_string(),
        user,
    }
}

#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostSpecInner);

#[derive(Debug, Deserialize)]
struct HostSpecInner {
    hostname: String,
    #[serde(default)]
    user: Option<String>,
}

impl FromStr for HostSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            hostname: s.to_string(),
            user: None,
        })
    }
}

/// YAML host file. Each entry is either a bare alias or a mapping:
///
/// ```yaml
/// - gpu1
/// - hostname: gpu2
///   user: alice
/// ```
#[derive(Debug, Default)]
pub struct HostsFile {
    hosts: Vec<String>,
    users: HashMap<String, String>,
}

impl HostsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Inventory(format!("failed to open {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| MonitorError::Inventory(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let specs: Vec<HostSpec> = serde_yaml::from_str(text)
            .map_err(|e| MonitorError::Inventory(format!("failed to parse host file: {}", e)))?;
        let mut file = HostsFile::default();
        for HostSpec(spec) in specs {
            if let Some(user) = spec.user {
                file.users.insert(spec.hostname.clone(), user);
            }
            file.hosts.push(spec.hostname);
        }
        Ok(file)
    }
}

impl Inventory for HostsFile {
    fn list_hosts(&self) -> Vec<String> {
        self.hosts.clone()
    }

    fn user_for(&self, alias: &str) -> Option<String> {
        self.users.get(alias).cloned()
    }
}

/// Host aliases declared in an OpenSSH client config.
///
/// Patterns containing `*`, `?` or `!` are not aliases and are skipped. A
/// `User` line applies to the aliases of the `Host` block it sits in.
#[derive(Debug, Default)]
pub struct SshConfigInventory {
    path: PathBuf,
    hosts: Vec<String>,
    users: HashMap<String, String>,
}

impl SshConfigInventory {
    /// Reads the config at `path`. A missing file is an empty inventory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(MonitorError::Inventory(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut inventory = Self::parse(&text);
        inventory.path = path.to_path_buf();
        Ok(inventory)
    }

    pub fn parse(text: &str) -> Self {
        let mut inventory = SshConfigInventory::default();
        // Aliases of the Host block currently being read.
        let mut block: Vec<String> = vec![];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = match line.split_once(|c: char| c.is_whitespace() || c == '=') {
                Some((keyword, rest)) => (keyword, rest.trim_start_matches('=').trim()),
                None => (line, ""),
            };
            match keyword.to_ascii_lowercase().as_str() {
                "host" => {
                    block.clear();
                    for pattern in rest.split_whitespace() {
                        if pattern.contains(['*', '?', '!']) {
                            continue;
                        }
                        block.push(pattern.to_string());
                        if !inventory.hosts.iter().any(|h| h == pattern) {
                            inventory.hosts.push(pattern.to_string());
                        }
                    }
                }
                "match" => block.clear(),
                "user" if !rest.is_empty() => {
                    for alias in &block {
                        // First obtained value wins, as in ssh itself.
                        inventory
                            .users
                            .entry(alias.clone())
                            .or_insert_with(|| rest.to_string());
                    }
                }
                _ => {}
            }
        }
        inventory
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Inventory for SshConfigInventory {
    fn list_hosts(&self) -> Vec<String> {
        self.hosts.clone()
    }

    fn user_for(&self, alias: &str) -> Option<String> {
        self.users.get(alias).cloned()
    }
}
