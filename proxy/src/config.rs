//! Route registry loaded from TOML.
//!
//! Each top-level table names a logical database:
//!
//! ```toml
//! [app]
//! addr = "db.internal"
//! dbname = "app_production"
//!
//! [app.ssh]
//! addr = "bastion.example.com"
//! user = "deploy"
//! identity = ["~/.ssh/id_ed25519"]
//! known_hosts = "~/.ssh/known_hosts"
//! ```

use std::collections::HashMap;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::error::{ProxyError, ProxyResult};

/// Default PostgreSQL port appended to destination addresses.
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Default SSH port appended to jump-host addresses.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identity files tried when a route doesn't list any.
pub const DEFAULT_IDENTITIES: [&str; 2] = ["~/.ssh/id_rsa", "~/.ssh/id_ed25519"];

/// Known-hosts file used when a route doesn't name one.
pub const DEFAULT_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";

/// One registry entry as written in the file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RouteEntry {
    addr: String,
    dbname: String,
    ssh: SshEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SshEntry {
    addr: String,
    user: String,
    identity: Option<Vec<String>>,
    known_hosts: String,
}

/// A resolved backend: where it lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// PostgreSQL address as seen from the jump host (host:port).
    pub addr: String,

    /// Database name sent upstream.
    pub dbname: String,

    /// SSH jump host.
    pub ssh: SshEndpoint,
}

/// SSH jump host and the credentials used against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// host:port of the SSH server.
    pub addr: String,

    /// Remote user name.
    pub user: String,

    /// Candidate private key paths, tried in order.
    pub identities: Vec<String>,

    /// Known-hosts path.
    pub known_hosts: String,
}

/// Immutable mapping from logical database name to route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    routes: HashMap<String, Route>,
}

impl Registry {
    pub fn new(routes: HashMap<String, Route>) -> Self {
        Self { routes }
    }

    /// Parse a registry from TOML, applying defaults.
    ///
    /// Any entry missing a required address fails the whole registry.
    pub fn from_toml(content: &str) -> Result<Self> {
        let entries: HashMap<String, RouteEntry> = toml::from_str(content)?;

        let mut routes = HashMap::with_capacity(entries.len());
        for (name, entry) in entries {
            let route = entry
                .into_route(&name)
                .with_context(|| format!("Invalid connection [{}]", name))?;
            routes.insert(name, route);
        }

        Ok(Self { routes })
    }

    /// Load the registry from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load the registry from a file, or return an empty one if the file doesn't exist.
    ///
    /// Any other read failure is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read config file: {}", path.display())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    /// Logical database names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteEntry {
    fn into_route(self, name: &str) -> Result<Route> {
        if self.addr.is_empty() {
            return Err(anyhow!("requires: `addr`"));
        }
        if self.ssh.addr.is_empty() {
            return Err(anyhow!("requires: `ssh.addr`"));
        }

        let dbname = if self.dbname.is_empty() {
            name.to_string()
        } else {
            self.dbname
        };
        let user = if self.ssh.user.is_empty() {
            current_username().unwrap_or_default()
        } else {
            self.ssh.user
        };
        let identities = self
            .ssh
            .identity
            .unwrap_or_else(|| DEFAULT_IDENTITIES.iter().map(|s| s.to_string()).collect());
        let known_hosts = if self.ssh.known_hosts.is_empty() {
            DEFAULT_KNOWN_HOSTS.to_string()
        } else {
            self.ssh.known_hosts
        };

        Ok(Route {
            addr: with_default_port(&self.addr, DEFAULT_PG_PORT),
            dbname,
            ssh: SshEndpoint {
                addr: with_default_port(&self.ssh.addr, DEFAULT_SSH_PORT),
                user,
                identities,
                known_hosts,
            },
        })
    }
}

/// Name of the user running the proxy.
pub fn current_username() -> Option<String> {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

/// Append `port` unless `addr` already ends in one.
///
/// Bare IPv6 literals are bracketed first.
pub fn with_default_port(addr: &str, port: u16) -> String {
    if has_port(addr) {
        addr.to_string()
    } else if addr.contains(':') && !addr.starts_with('[') {
        format!("[{}]:{}", addr, port)
    } else {
        format!("{}:{}", addr, port)
    }
}

fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (host.ends_with(']') || !host.contains(':'))
        }
        None => false,
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> ProxyResult<(String, u16)> {
    let invalid = || ProxyError::InvalidAddress(addr.to_string());

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }

    Ok((host.to_string(), port))
}
