//! The validated, read-only configuration.
//!
//! A [`Topology`] is produced once by [`crate::validate`] and shared
//! between workers as `Arc<Topology>`. Entries are looked up by key in
//! O(1); the ordered vectors keep declaration order for the dump and for
//! route matching.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use pgmux_machine::{TlsMode, TlsPolicy};

// ── Modes ────────────────────────────────────────────────────────────

/// When a server connection goes back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolingMode {
    /// Held for the whole client session.
    Session,
    /// Returned after every transaction.
    Transaction,
}

impl PoolingMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "session" => Some(Self::Session),
            "transaction" => Some(Self::Transaction),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Transaction => "transaction",
        }
    }
}

/// How clients are mapped onto servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    Forward,
}

impl RoutingMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "forward" => Some(Self::Forward),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
        }
    }
}

/// Client authentication method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthMode {
    None,
    ClearText,
    Md5,
}

impl AuthMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "clear_text" => Some(Self::ClearText),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClearText => "clear_text",
            Self::Md5 => "md5",
        }
    }

    pub fn requires_password(self) -> bool {
        matches!(self, Self::ClearText | Self::Md5)
    }
}

/// TLS mode names accepted in configuration files.
pub fn tls_mode_from_name(name: &str) -> Option<TlsMode> {
    match name {
        "disable" => Some(TlsMode::Disable),
        "allow" => Some(TlsMode::Allow),
        "require" => Some(TlsMode::Require),
        "verify_ca" => Some(TlsMode::VerifyCa),
        "verify_full" => Some(TlsMode::VerifyFull),
        _ => None,
    }
}

macro_rules! impl_display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

impl_display_as_str!(PoolingMode, RoutingMode, AuthMode);

// ── Entries ──────────────────────────────────────────────────────────

/// TLS settings of an endpoint as configured. `mode` is `None` when the
/// configuration did not mention TLS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSpec {
    pub mode: Option<TlsMode>,
    pub ca_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub protocols: Option<String>,
}

impl TlsSpec {
    /// Client policy for connecting to an endpoint known as `host`.
    pub fn policy(&self, host: &str) -> TlsPolicy {
        TlsPolicy {
            mode: self.mode.unwrap_or_default(),
            server_name: Some(host.to_owned()),
            ca_file: self.ca_file.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            protocols: self.protocols.clone(),
            ..TlsPolicy::default()
        }
    }
}

/// Validated `[listen]` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenSpec {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub nodelay: bool,
    pub keepalive: u32,
    pub tls: TlsSpec,
}

/// Validated backend server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
    /// Position in declaration order.
    pub id: usize,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsSpec,
}

impl ServerSpec {
    pub fn tls_policy(&self) -> TlsPolicy {
        self.tls.policy(&self.host)
    }
}

/// Validated route with its server resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub target: String,
    pub server: Arc<ServerSpec>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub ttl: u32,
    pub pool_size: u32,
    pub pool_timeout: u32,
    pub client_max: u32,
    pub cancel: bool,
    pub discard: bool,
    pub rollback: bool,
    pub is_default: bool,
}

/// Validated user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserSpec {
    pub name: String,
    pub password: Option<String>,
    pub auth: AuthMode,
    pub is_default: bool,
    pub is_deny: bool,
}

// ── Topology ─────────────────────────────────────────────────────────

/// The whole validated configuration.
#[derive(Clone, Debug)]
pub struct Topology {
    pub config_file: Option<PathBuf>,
    pub log_debug: bool,
    pub log_config: bool,
    pub readahead: u32,
    pub workers: u32,
    pub client_max: u32,
    pub pooling: PoolingMode,
    pub routing: RoutingMode,
    pub listen: ListenSpec,
    pub(crate) servers: Vec<Arc<ServerSpec>>,
    pub(crate) server_index: HashMap<String, usize>,
    pub(crate) routes: Vec<Arc<RouteSpec>>,
    pub(crate) route_index: HashMap<String, usize>,
    pub(crate) users: Vec<Arc<UserSpec>>,
    pub(crate) user_index: HashMap<String, usize>,
    pub(crate) routing_default: Option<usize>,
    pub(crate) users_default: Option<usize>,
}

impl Topology {
    pub fn server(&self, name: &str) -> Option<&Arc<ServerSpec>> {
        self.server_index.get(name).map(|&i| &self.servers[i])
    }

    pub fn route(&self, target: &str) -> Option<&Arc<RouteSpec>> {
        self.route_index.get(target).map(|&i| &self.routes[i])
    }

    pub fn user(&self, name: &str) -> Option<&Arc<UserSpec>> {
        self.user_index.get(name).map(|&i| &self.users[i])
    }

    /// Servers in declaration order.
    pub fn servers(&self) -> &[Arc<ServerSpec>] {
        &self.servers
    }

    /// Routes in declaration order.
    pub fn routes(&self) -> &[Arc<RouteSpec>] {
        &self.routes
    }

    /// Users in declaration order.
    pub fn users(&self) -> &[Arc<UserSpec>] {
        &self.users
    }

    /// The route marked `is_default`, if any.
    pub fn routing_default(&self) -> Option<&Arc<RouteSpec>> {
        self.routing_default.map(|i| &self.routes[i])
    }

    /// The default user, if any.
    pub fn users_default(&self) -> Option<&Arc<UserSpec>> {
        self.users_default.map(|i| &self.users[i])
    }
}
