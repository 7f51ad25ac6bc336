//! pgmux-machine: the cooperative machinery of the pooler.
//!
//! Coroutines run on per-worker [`Machine`]s and suspend only inside the
//! [`Call`] primitive. The connect state machine ([`Connection::connect`])
//! drives a non-blocking socket connect through a Call that is resolved by
//! exactly one of write readiness, a timer, or cancellation, and then
//! optionally upgrades the connection to TLS.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pgmux_machine::{Connection, Scheduler, SockAddr};
//!
//! # async fn demo() -> pgmux_machine::MachineResult<()> {
//! let scheduler = Scheduler::current()?;
//! let addr = SockAddr::from("127.0.0.1:5432".parse::<std::net::SocketAddr>().unwrap());
//! let task = scheduler.spawn(move |ctx| async move {
//!     let mut conn = Connection::new();
//!     conn.connect(&ctx, &addr, Duration::from_secs(1)).await?;
//!     conn.into_transport()
//! });
//! let _transport = task.join().await??;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod connect;
pub mod coroutine;
pub mod error;
pub mod event_loop;
pub mod io;
pub mod scheduler;
pub mod socket;
pub mod tls;

pub use call::{Call, CallResolver, Outcome};
pub use coroutine::{Coroutine, CoroutineId};
pub use error::{MachineError, MachineResult};
pub use event_loop::{EventLoop, TokioEventLoop, WriteCallback};
pub use io::{Connection, RawStream, Transport};
pub use scheduler::{Context, Machine, MachinePool, Scheduler, Task};
pub use tls::{TlsMode, TlsPolicy};

pub use socket2::SockAddr;
