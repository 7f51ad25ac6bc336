//! pgmux-router: where a client goes and which server connection it gets.
//!
//! [`Router`] resolves a client's database and user to a route and a user
//! entry of the shared [`pgmux_scheme::Topology`]. [`PoolManager`] keeps one
//! bounded [`RoutePool`] of server connections per route, opened through a
//! [`ServerConnector`]; [`MachineConnector`] is the production connector
//! built on the machine's connect state machine.

pub mod error;
pub mod pool;
pub mod router;

pub use error::{RouterError, RouterResult};
pub use pool::{
    ClientSlot, Connecting, Lease, MachineConnector, PoolManager, PoolStats, RouteFlags, RoutePool,
    ServerConnector, server_addr,
};
pub use router::Router;
