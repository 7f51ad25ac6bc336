//! The raw configuration model, as read from `pgmux.toml`.
//!
//! Nothing here is checked: modes are still strings and routes still name
//! their server. [`crate::validate`] turns a [`Scheme`] into a
//! [`crate::Topology`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{SchemeError, SchemeResult};

/// Root configuration object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scheme {
    /// Path the scheme was loaded from.
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
    pub log_debug: bool,
    pub log_config: bool,
    pub listen: Listen,
    pub readahead: u32,
    pub workers: u32,
    pub client_max: u32,
    pub pooling: Option<String>,
    pub routing: Option<String>,
    #[serde(rename = "server")]
    pub servers: Vec<Server>,
    #[serde(rename = "route")]
    pub routes: Vec<Route>,
    #[serde(rename = "user")]
    pub users: Vec<User>,
}

impl Default for Scheme {
    fn default() -> Self {
        Self {
            config_file: None,
            log_debug: false,
            log_config: false,
            listen: Listen::default(),
            readahead: 8192,
            workers: 1,
            client_max: 100,
            pooling: None,
            routing: None,
            servers: Vec::new(),
            routes: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// The `[listen]` block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Listen {
    /// Unset means all interfaces.
    pub host: Option<String>,
    pub port: u16,
    pub backlog: u32,
    pub nodelay: bool,
    pub keepalive: u32,
    pub tls_mode: Option<String>,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_protocols: Option<String>,
}

impl Default for Listen {
    fn default() -> Self {
        Self {
            host: None,
            port: 6432,
            backlog: 128,
            nodelay: true,
            keepalive: 7200,
            tls_mode: None,
            tls_ca_file: None,
            tls_key_file: None,
            tls_cert_file: None,
            tls_protocols: None,
        }
    }
}

/// A `[[server]]` entry: one backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Server {
    pub name: String,
    pub host: Option<String>,
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub tls_mode: Option<String>,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_protocols: Option<String>,
}

impl Server {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            port: default_server_port(),
            tls_mode: None,
            tls_ca_file: None,
            tls_key_file: None,
            tls_cert_file: None,
            tls_protocols: None,
        }
    }
}

/// A `[[route]]` entry: maps clients onto a server and a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub target: String,
    /// Name of the server this route forwards to.
    pub route: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    /// Idle server connection lifetime in seconds; 0 keeps them forever.
    #[serde(default)]
    pub ttl: u32,
    #[serde(default = "default_limit")]
    pub pool_size: u32,
    /// Milliseconds to wait for a pooled connection; 0 waits forever.
    #[serde(default)]
    pub pool_timeout: u32,
    #[serde(default = "default_limit")]
    pub client_max: u32,
    #[serde(default = "default_true")]
    pub cancel: bool,
    #[serde(default = "default_true")]
    pub discard: bool,
    #[serde(default = "default_true")]
    pub rollback: bool,
    #[serde(default)]
    pub is_default: bool,
}

impl Route {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            route: None,
            database: None,
            user: None,
            ttl: 0,
            pool_size: default_limit(),
            pool_timeout: 0,
            client_max: default_limit(),
            cancel: true,
            discard: true,
            rollback: true,
            is_default: false,
        }
    }
}

/// A `[[user]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    /// User name; the name `default` marks the default user.
    pub name: String,
    pub password: Option<String>,
    pub auth: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_deny: bool,
}

/// Name that marks the default user.
pub const DEFAULT_USER: &str = "default";

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            auth: None,
            is_default: false,
            is_deny: false,
        }
    }

    /// Whether this entry is the default user, by flag or by name.
    pub fn is_default_user(&self) -> bool {
        self.is_default || self.name == DEFAULT_USER
    }
}

fn default_server_port() -> u16 {
    5432
}

fn default_limit() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a server and return it for further population.
    pub fn add_server(&mut self, server: Server) -> &mut Server {
        self.servers.push(server);
        let last = self.servers.len() - 1;
        &mut self.servers[last]
    }

    /// Append a route and return it for further population.
    pub fn add_route(&mut self, route: Route) -> &mut Route {
        self.routes.push(route);
        let last = self.routes.len() - 1;
        &mut self.routes[last]
    }

    /// Append a user and return it for further population.
    pub fn add_user(&mut self, user: User) -> &mut User {
        self.users.push(user);
        let last = self.users.len() - 1;
        &mut self.users[last]
    }

    /// First server with this name.
    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// First route with this target.
    pub fn route(&self, target: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.target == target)
    }

    /// First user with this name.
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Parse a scheme from TOML text.
    pub fn from_toml_str(content: &str) -> SchemeResult<Self> {
        toml::from_str(content).map_err(|source| SchemeError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Read and parse a scheme file, recording its path.
    pub fn load(path: &Path) -> SchemeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SchemeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut scheme: Scheme = toml::from_str(&content).map_err(|source| SchemeError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        scheme.config_file = Some(path.to_path_buf());
        tracing::debug!(
            path = %path.display(),
            servers = scheme.servers.len(),
            routes = scheme.routes.len(),
            users = scheme.users.len(),
            "scheme loaded"
        );
        Ok(scheme)
    }
}
