//! Error types for reading and validating a scheme.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for scheme operations.
pub type SchemeResult<T> = Result<T, SchemeError>;

/// Errors that can occur while loading or validating a scheme.
#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// First rule a scheme violated. The display form is the single
/// diagnostic line reported at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pooling mode is not set")]
    PoolingNotSet,

    #[error("unknown pooling mode '{0}'")]
    UnknownPooling(String),

    #[error("bad workers number")]
    BadWorkers,

    #[error("routing mode is not set")]
    RoutingNotSet,

    #[error("unknown routing mode '{0}'")]
    UnknownRouting(String),

    #[error("unknown tls mode '{0}'")]
    UnknownTlsMode(String),

    #[error("no servers defined")]
    NoServers,

    #[error("server '{0}': no host is specified")]
    NoServerHost(String),

    #[error("server '{server}': unknown tls mode '{mode}'")]
    UnknownServerTlsMode { server: String, mode: String },

    #[error("server '{0}': duplicate server name")]
    DuplicateServer(String),

    #[error("route '{0}': no route server is specified")]
    NoRouteServer(String),

    #[error("route '{route}': no route server '{server}' found")]
    RouteServerNotFound { route: String, server: String },

    #[error("route '{0}': duplicate route target")]
    DuplicateRoute(String),

    #[error("more than one default route")]
    MultipleDefaultRoutes,

    #[error("no users defined")]
    NoUsers,

    #[error("default user authentication mode is not defined")]
    DefaultUserAuthNotSet,

    #[error("user '{0}' authentication mode is not defined")]
    UserAuthNotSet(String),

    #[error("user '{0}' password is not set")]
    UserPasswordNotSet(String),

    #[error("user '{user}' has unknown authentication mode '{mode}'")]
    UnknownAuthMode { user: String, mode: String },

    #[error("user '{0}': duplicate user name")]
    DuplicateUser(String),

    #[error("more than one default user")]
    MultipleDefaultUsers,
}
