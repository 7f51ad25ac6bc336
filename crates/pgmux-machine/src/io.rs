//! The io object: one server socket under construction or in use.
//!
//! A [`Connection`] starts unset. [`Connection::connect`] (see
//! `connect.rs`) drives it to connected, optionally through a TLS
//! upgrade, after which [`Connection::into_transport`] hands the stream
//! to tokio for the protocol layer. A failed connect always leaves the
//! object unset again: no descriptor, not attached, not connected.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use socket2::{SockAddr, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::call::Call;
use crate::error::{MachineError, MachineResult};
use crate::event_loop::EventLoop;
use crate::tls::TlsPolicy;

// ── Connection ───────────────────────────────────────────────────────

/// One socket endpoint, exclusively owned by a single coroutine until it
/// is turned into a [`Transport`].
pub struct Connection {
    pub(crate) socket: Option<Socket>,
    /// Set while the socket is attached to an event loop.
    pub(crate) event_loop: Option<Arc<dyn EventLoop>>,
    pub(crate) connected: bool,
    pub(crate) connect: Call,
    pub(crate) errno: i32,
    pub(crate) peer: Option<SockAddr>,
    pub(crate) tls: Option<TlsPolicy>,
    /// Stream after a successful TLS upgrade; owns the socket from then on.
    pub(crate) session: Option<Transport>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            socket: None,
            event_loop: None,
            connected: false,
            connect: Call::new(),
            errno: 0,
            peer: None,
            tls: None,
            session: None,
        }
    }

    /// A connection that upgrades to TLS after connecting, unless the
    /// policy mode is `disable`.
    pub fn with_tls(policy: TlsPolicy) -> Self {
        let mut conn = Self::new();
        conn.tls = Some(policy);
        conn
    }

    pub fn tls_policy(&self) -> Option<&TlsPolicy> {
        self.tls.as_ref()
    }

    /// Whether the last connect attempt ended in a timeout.
    pub fn connect_timed_out(&self) -> bool {
        self.connect.timed_out()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_attached(&self) -> bool {
        self.event_loop.is_some()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.session, Some(Transport::Tls(_)))
    }

    /// Descriptor of the socket, if one is open.
    pub fn fd(&self) -> Option<RawFd> {
        match (&self.socket, &self.session) {
            (Some(socket), _) => Some(socket.as_raw_fd()),
            (None, Some(session)) => Some(session.as_raw_fd()),
            (None, None) => None,
        }
    }

    /// Status code of the last failed operation, 0 after success.
    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn peer(&self) -> Option<&SockAddr> {
        self.peer.as_ref()
    }

    /// Close the socket and return to the unset state.
    pub fn close(&mut self) {
        self.detach_quietly();
        if let Some(socket) = self.socket.take() {
            debug!(fd = socket.as_raw_fd(), "connection closed");
        }
        self.session = None;
        self.connected = false;
        self.peer = None;
    }

    /// Hand the established stream over to tokio.
    ///
    /// Must be called on the runtime that will drive the stream.
    pub fn into_transport(mut self) -> MachineResult<Transport> {
        if let Some(session) = self.session.take() {
            self.connected = false;
            return Ok(session);
        }
        let socket = self.take_socket()?;
        let stream = RawStream::from_socket(socket).map_err(MachineError::Socket)?;
        self.connected = false;
        Ok(Transport::Plain(stream))
    }

    /// Detach and take the connected socket out of the object.
    pub(crate) fn take_socket(&mut self) -> MachineResult<Socket> {
        if !self.connected {
            return Err(MachineError::NotConnected);
        }
        let socket = self.socket.take().ok_or(MachineError::NotConnected)?;
        if let Some(event_loop) = self.event_loop.take() {
            event_loop
                .detach(socket.as_raw_fd())
                .map_err(MachineError::Attach)?;
        }
        Ok(socket)
    }

    fn detach_quietly(&mut self) {
        if let (Some(event_loop), Some(socket)) = (self.event_loop.take(), &self.socket) {
            let fd = socket.as_raw_fd();
            if let Err(err) = event_loop.detach(fd) {
                warn!(fd, error = %err, "event loop detach failed");
            }
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.detach_quietly();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("attached", &self.is_attached())
            .field("connected", &self.connected)
            .field("tls", &self.is_tls())
            .field("errno", &self.errno)
            .finish()
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// Connected stream socket, TCP or unix domain.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    /// Register a connected non-blocking socket with the current runtime.
    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        if socket.local_addr()?.as_socket().is_some() {
            TcpStream::from_std(std::net::TcpStream::from(socket)).map(RawStream::Tcp)
        } else {
            UnixStream::from_std(std::os::unix::net::UnixStream::from(socket)).map(RawStream::Unix)
        }
    }
}

impl AsRawFd for RawStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            RawStream::Tcp(s) => s.as_raw_fd(),
            RawStream::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Established server stream, plain or TLS-wrapped.
pub enum Transport {
    Plain(RawStream),
    Tls(Box<TlsStream<RawStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(s) => s.as_raw_fd(),
            Transport::Tls(s) => s.get_ref().0.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("fd", &self.as_raw_fd())
            .field("tls", &self.is_tls())
            .finish()
    }
}

macro_rules! delegate {
    ($self:ident, $s:ident => $call:expr) => {
        match $self.get_mut() {
            Transport::Plain(RawStream::Tcp($s)) => $call,
            Transport::Plain(RawStream::Unix($s)) => $call,
            Transport::Tls($s) => $call,
        }
    };
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            RawStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RawStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            RawStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            RawStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            RawStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
