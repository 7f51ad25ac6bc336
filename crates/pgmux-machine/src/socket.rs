//! Non-blocking socket helpers.

use std::io;
use std::os::fd::BorrowedFd;

use socket2::{SockAddr, SockRef, Socket, Type};

/// Result of the first connect attempt on a non-blocking socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// The kernel completed the connect synchronously.
    Connected,
    /// Completion will be signalled by write readiness.
    InProgress,
}

/// Create a non-blocking stream socket for the address family of `addr`.
pub fn open(addr: &SockAddr) -> io::Result<Socket> {
    let socket = Socket::new(addr.domain(), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    if addr.as_socket().is_some() {
        // Small protocol messages; latency matters more than coalescing.
        socket.set_nodelay(true)?;
    }
    Ok(socket)
}

/// Issue the non-blocking connect.
pub fn start_connect(socket: &Socket, addr: &SockAddr) -> io::Result<ConnectStart> {
    match socket.connect(addr) {
        Ok(()) => Ok(ConnectStart::Connected),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(ConnectStart::InProgress),
        Err(err) => Err(err),
    }
}

/// Read and clear the pending socket error (`SO_ERROR`); 0 means none.
pub fn pending_error(fd: BorrowedFd<'_>) -> i32 {
    match SockRef::from(&fd).take_error() {
        Ok(None) => 0,
        Ok(Some(err)) | Err(err) => err.raw_os_error().unwrap_or(libc::EIO),
    }
}
