//! Error types for the cooperative machinery.

use std::io;

use thiserror::Error;

/// Result type alias for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// Errors reported by the call primitive, the connect state machine and
/// the TLS upgrade.
///
/// Every variant maps onto an errno-style status code via
/// [`MachineError::errno`], which is what [`crate::Connection::errno`]
/// records after a failed operation.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("coroutine cancelled")]
    Cancelled,

    #[error("call is already active")]
    AlreadyActive,

    #[error("connection is already established")]
    AlreadyConnected,

    #[error("connection is not established")]
    NotConnected,

    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    #[error("event loop attach failed: {0}")]
    Attach(#[source] io::Error),

    #[error("event loop registration failed: {0}")]
    Register(#[source] io::Error),

    #[error("connect failed: {}", describe_errno(.errno))]
    Connect { errno: i32 },

    #[error("connect timed out")]
    TimedOut,

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl MachineError {
    /// Status code for this error, in the vocabulary of socket errors.
    pub fn errno(&self) -> i32 {
        match self {
            MachineError::Cancelled => libc::ECANCELED,
            MachineError::AlreadyActive | MachineError::AlreadyConnected => libc::EINPROGRESS,
            MachineError::NotConnected => libc::ENOTCONN,
            MachineError::Socket(e) | MachineError::Attach(e) | MachineError::Register(e) => {
                e.raw_os_error().unwrap_or(libc::EIO)
            }
            MachineError::Connect { errno } => *errno,
            MachineError::TimedOut => libc::ETIMEDOUT,
            MachineError::Tls(_) | MachineError::TlsConfig(_) => libc::EPROTO,
            MachineError::Worker(_) => libc::EIO,
        }
    }

    /// Whether the error is the distinguishable timeout condition.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MachineError::TimedOut)
    }

    /// Whether the error is the distinguishable cancellation condition.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MachineError::Cancelled)
    }
}

fn describe_errno(errno: &i32) -> String {
    io::Error::from_raw_os_error(*errno).to_string()
}
