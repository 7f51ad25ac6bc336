//! Error types for routing and pooling.

use std::io;

use pgmux_machine::MachineError;
use thiserror::Error;

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no route for database '{database}' user '{user}'")]
    NoRoute { database: String, user: String },

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("user '{0}' is denied")]
    Denied(String),

    #[error("route '{route}': server pool exhausted after {timeout_ms} ms")]
    PoolExhausted { route: String, timeout_ms: u32 },

    #[error("route '{route}': client limit of {max} reached")]
    ClientLimit { route: String, max: u32 },

    #[error("route '{0}': pool is draining")]
    Draining(String),

    #[error("server '{server}': cannot resolve address: {source}")]
    Resolve {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("server '{server}': {source}")]
    Connect {
        server: String,
        #[source]
        source: MachineError,
    },

    #[error(transparent)]
    Machine(#[from] MachineError),
}
