//! pgmux-scheme: configuration model of the pooler.
//!
//! A [`Scheme`] is the raw `pgmux.toml` document. [`validate`] checks it
//! and produces a [`Topology`], the immutable configuration every worker
//! shares. [`Topology::dump`] renders it for the startup log.

pub mod dump;
pub mod error;
pub mod scheme;
pub mod topology;
pub mod validate;

pub use error::{SchemeError, SchemeResult, ValidationError};
pub use scheme::{DEFAULT_USER, Listen, Route, Scheme, Server, User};
pub use topology::{
    AuthMode, ListenSpec, PoolingMode, RouteSpec, RoutingMode, ServerSpec, TlsSpec, Topology,
    UserSpec, tls_mode_from_name,
};
pub use validate::validate;

impl Scheme {
    /// Validate this scheme. See [`validate`].
    pub fn validate(&self) -> SchemeResult<Topology> {
        validate::validate(self)
    }
}
