//! The connect state machine.
//!
//! ```text
//! preconditions ─► open ─► connect() ──sync──────────────────────────► connected
//!                            │
//!                       EINPROGRESS
//!                            ▼
//!              attach ─► on_writable ─► Call::activate ─► cancel_writable
//!                                            │
//!                 completed(0) ──────────────┴──► connected ─► [tls] ─► done
//!                 completed(errno) / timed out / aborted ──► close, reset
//! ```
//!
//! Only `Call::activate` suspends. The descriptor is owned by a
//! [`SocketGuard`] until the TCP connect has succeeded, so every failure
//! path (including the caller dropping the future) unregisters, detaches
//! and closes it.

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tracing::{debug, warn};

use crate::call::Outcome;
use crate::error::{MachineError, MachineResult};
use crate::event_loop::EventLoop;
use crate::io::{Connection, RawStream, Transport};
use crate::scheduler::Context;
use crate::socket::{self, ConnectStart};
use crate::tls;

impl Connection {
    /// Connect to `addr`, waiting at most `timeout` (zero waits
    /// indefinitely), then upgrade to TLS if a policy asks for it.
    ///
    /// On failure the connection is left unset and [`Connection::errno`]
    /// holds the status code of the error. A timeout is additionally
    /// reported by [`Connection::connect_timed_out`].
    pub async fn connect(
        &mut self,
        ctx: &Context,
        addr: &SockAddr,
        timeout: Duration,
    ) -> MachineResult<()> {
        self.errno = 0;
        let result = self.try_connect(ctx, addr, timeout).await;
        if let Err(err) = &result {
            self.errno = err.errno();
            debug!(
                coroutine = %ctx.coroutine().id(),
                errno = self.errno,
                error = %err,
                "connect failed"
            );
        }
        result
    }

    async fn try_connect(
        &mut self,
        ctx: &Context,
        addr: &SockAddr,
        timeout: Duration,
    ) -> MachineResult<()> {
        if ctx.coroutine().is_cancelled() {
            return Err(MachineError::Cancelled);
        }
        if self.connect.is_active() {
            return Err(MachineError::AlreadyActive);
        }
        if self.connected {
            return Err(MachineError::AlreadyConnected);
        }

        let socket = socket::open(addr).map_err(MachineError::Socket)?;
        let start = socket::start_connect(&socket, addr).map_err(MachineError::Socket)?;
        let mut guard = SocketGuard::new(socket);

        match start {
            ConnectStart::Connected => {
                debug!(fd = guard.fd(), "connect completed synchronously");
            }
            ConnectStart::InProgress => {
                let fd = guard.fd();
                guard
                    .attach(ctx.event_loop())
                    .map_err(MachineError::Attach)?;

                let resolver = self.connect.resolver();
                ctx.event_loop()
                    .on_writable(
                        fd,
                        Box::new(move |fd| {
                            resolver.complete(socket::pending_error(fd));
                        }),
                    )
                    .map_err(MachineError::Register)?;
                guard.watching = true;

                let outcome = self.connect.activate(ctx.coroutine(), timeout).await;
                guard.unwatch();

                match outcome? {
                    Outcome::Completed(0) => {
                        debug!(fd, "connect completed");
                    }
                    Outcome::Completed(errno) => return Err(MachineError::Connect { errno }),
                    Outcome::TimedOut => return Err(MachineError::TimedOut),
                    Outcome::Aborted => return Err(MachineError::Cancelled),
                }
            }
        }

        let (socket, event_loop) = guard.disarm();
        self.socket = socket;
        self.event_loop = event_loop;
        self.connected = true;
        self.peer = Some(addr.clone());

        if let Some(policy) = self.tls.clone().filter(|p| p.mode.is_enabled()) {
            if let Err(err) = self.upgrade_tls(&policy).await {
                self.close();
                return Err(err);
            }
        }
        Ok(())
    }

    async fn upgrade_tls(&mut self, policy: &tls::TlsPolicy) -> MachineResult<()> {
        let server_name = policy.server_name(self.peer.as_ref())?;
        let socket = self.take_socket()?;
        let stream = RawStream::from_socket(socket).map_err(MachineError::Socket)?;
        let session = tls::upgrade(stream, policy, server_name).await?;
        self.session = Some(Transport::Tls(Box::new(session)));
        Ok(())
    }
}

/// Owns a socket under construction and releases it on drop unless
/// disarmed.
struct SocketGuard {
    socket: Option<Socket>,
    event_loop: Option<Arc<dyn EventLoop>>,
    watching: bool,
}

impl SocketGuard {
    fn new(socket: Socket) -> Self {
        Self {
            socket: Some(socket),
            event_loop: None,
            watching: false,
        }
    }

    fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn attach(&mut self, event_loop: &Arc<dyn EventLoop>) -> std::io::Result<()> {
        let Some(socket) = &self.socket else {
            return Err(std::io::ErrorKind::NotConnected.into());
        };
        event_loop.attach(socket.as_fd())?;
        self.event_loop = Some(Arc::clone(event_loop));
        Ok(())
    }

    /// Drop write interest. Always done once the wait is over.
    fn unwatch(&mut self) {
        if !std::mem::take(&mut self.watching) {
            return;
        }
        if let Some(event_loop) = &self.event_loop {
            let fd = self.fd();
            if let Err(err) = event_loop.cancel_writable(fd) {
                warn!(fd, error = %err, "write interest cancel failed");
            }
        }
    }

    /// Release ownership to the caller.
    fn disarm(mut self) -> (Option<Socket>, Option<Arc<dyn EventLoop>>) {
        (self.socket.take(), self.event_loop.take())
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.unwatch();
        let Some(socket) = self.socket.take() else {
            return;
        };
        let fd = socket.as_raw_fd();
        if let Some(event_loop) = self.event_loop.take() {
            if let Err(err) = event_loop.detach(fd) {
                warn!(fd, error = %err, "event loop detach failed");
            }
        }
        drop(socket);
        debug!(fd, "socket closed");
    }
}
