//! Event loop boundary: socket readiness notifications.
//!
//! The connect state machine needs exactly four operations from the loop:
//! attach a descriptor, register a one-shot write-readiness callback,
//! unregister it, and detach the descriptor. [`EventLoop`] is that seam;
//! tests substitute a recording fake, production uses [`TokioEventLoop`].
//!
//! # Architecture
//!
//! ```text
//! attach(fd)            → dup(fd) wrapped in AsyncFd (registered with the reactor)
//! on_writable(fd, cb)   → task: AsyncFd::writable().await → cb(fd)
//! cancel_writable(fd)   → abort the task (cb never runs)
//! detach(fd)            → drop the AsyncFd (deregisters, closes the dup)
//! ```
//!
//! The loop watches a duplicate of the caller's descriptor, so the caller
//! may close its own descriptor right after `detach` without racing a
//! late deregistration against descriptor-number reuse.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Write-readiness callback. Invoked at most once per registration with
/// the watched descriptor.
pub type WriteCallback = Box<dyn FnOnce(BorrowedFd<'_>) + Send + 'static>;

/// Socket-readiness source used by the connect state machine.
pub trait EventLoop: Send + Sync {
    /// Start tracking a descriptor.
    fn attach(&self, fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Register a one-shot callback for write readiness of an attached descriptor.
    fn on_writable(&self, fd: RawFd, callback: WriteCallback) -> io::Result<()>;

    /// Drop a pending write-readiness registration, if any.
    fn cancel_writable(&self, fd: RawFd) -> io::Result<()>;

    /// Stop tracking a descriptor. Pending registrations are dropped.
    fn detach(&self, fd: RawFd) -> io::Result<()>;
}

/// A tracked descriptor.
struct Registration {
    watched: Arc<AsyncFd<OwnedFd>>,
    /// Task waiting for write readiness.
    writer: Option<JoinHandle<()>>,
}

/// Production [`EventLoop`] backed by the tokio reactor of one worker.
pub struct TokioEventLoop {
    handle: Handle,
    registrations: Mutex<HashMap<RawFd, Registration>>,
}

impl TokioEventLoop {
    /// Create a loop bound to the current runtime.
    ///
    /// Fails outside of a tokio runtime context.
    pub fn new() -> io::Result<Self> {
        let handle = Handle::try_current().map_err(io::Error::other)?;
        Ok(Self::with_handle(handle))
    }

    /// Create a loop bound to the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Number of currently attached descriptors.
    pub fn attached_count(&self) -> usize {
        self.registrations().len()
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<RawFd, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_attached(fd: RawFd) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("descriptor {fd} is not attached"),
    )
}

impl EventLoop for TokioEventLoop {
    fn attach(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        let mut registrations = self.registrations();
        if registrations.contains_key(&raw) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {raw} is already attached"),
            ));
        }

        let owned = fd.try_clone_to_owned()?;
        let watched = {
            let _runtime = self.handle.enter();
            let interest = Interest::READABLE.add(Interest::WRITABLE);
            // SAFETY: `owned` is a private duplicate that stays open and is
            // never replaced until the AsyncFd drops it.
            unsafe { AsyncFd::register_with_interest(owned, interest) }?
        };
        registrations.insert(
            raw,
            Registration {
                watched: Arc::new(watched),
                writer: None,
            },
        );
        debug!(fd = raw, "descriptor attached");
        Ok(())
    }

    fn on_writable(&self, fd: RawFd, callback: WriteCallback) -> io::Result<()> {
        let mut registrations = self.registrations();
        let registration = registrations.get_mut(&fd).ok_or_else(|| not_attached(fd))?;
        if registration
            .writer
            .as_ref()
            .is_some_and(|writer| !writer.is_finished())
        {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} already has write interest"),
            ));
        }

        let watched = Arc::clone(&registration.watched);
        registration.writer = Some(self.handle.spawn(async move {
            if let Err(err) = watched.writable().await.map(drop) {
                // The callback still runs: it reads the socket error itself.
                debug!(fd, error = %err, "write readiness wait failed");
            }
            callback(watched.get_ref().as_fd());
        }));
        debug!(fd, "write interest registered");
        Ok(())
    }

    fn cancel_writable(&self, fd: RawFd) -> io::Result<()> {
        let mut registrations = self.registrations();
        let registration = registrations.get_mut(&fd).ok_or_else(|| not_attached(fd))?;
        if let Some(writer) = registration.writer.take() {
            writer.abort();
            debug!(fd, "write interest unregistered");
        }
        Ok(())
    }

    fn detach(&self, fd: RawFd) -> io::Result<()> {
        let registration = self
            .registrations()
            .remove(&fd)
            .ok_or_else(|| not_attached(fd))?;
        if let Some(writer) = registration.writer {
            writer.abort();
        }
        debug!(fd, "descriptor detached");
        Ok(())
    }
}

impl std::fmt::Debug for TokioEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioEventLoop")
            .field("attached", &self.attached_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    // ── attach / detach ─────────────────────────────────────────────

    #[tokio::test]
    async fn attach_then_detach() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();

        event_loop.attach(client.as_fd()).unwrap();
        assert_eq!(event_loop.attached_count(), 1);

        event_loop.detach(client.as_raw_fd()).unwrap();
        assert_eq!(event_loop.attached_count(), 0);
    }

    #[tokio::test]
    async fn detach_leaves_the_caller_descriptor_open() {
        use std::io::{Read, Write};

        let event_loop = TokioEventLoop::new().unwrap();
        let (mut client, mut server) = connected_pair();

        event_loop.attach(client.as_fd()).unwrap();
        event_loop.detach(client.as_raw_fd()).unwrap();

        client.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn double_attach_is_rejected() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();

        event_loop.attach(client.as_fd()).unwrap();
        let err = event_loop.attach(client.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn operations_on_unattached_fd_fail() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();
        let fd = client.as_raw_fd();

        let err = event_loop.on_writable(fd, Box::new(|_| {})).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(
            event_loop.cancel_writable(fd).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            event_loop.detach(fd).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(TokioEventLoop::new().is_err());
    }

    // ── write readiness ─────────────────────────────────────────────

    #[tokio::test]
    async fn writable_callback_fires_for_connected_socket() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();
        client.set_nonblocking(true).unwrap();
        let fd = client.as_raw_fd();

        let (tx, rx) = tokio::sync::oneshot::channel();
        event_loop.attach(client.as_fd()).unwrap();
        event_loop
            .on_writable(
                fd,
                Box::new(move |_| {
                    let _ = tx.send(());
                }),
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("connected socket should be writable")
            .unwrap();
        event_loop.detach(fd).unwrap();
    }

    #[tokio::test]
    async fn second_registration_is_rejected_while_pending() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();
        let fd = client.as_raw_fd();

        event_loop.attach(client.as_fd()).unwrap();
        event_loop.on_writable(fd, Box::new(|_| {})).unwrap();
        // The writer task has not been polled yet on this single-threaded runtime.
        let err = event_loop.on_writable(fd, Box::new(|_| {})).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn cancelled_registration_never_fires() {
        let event_loop = TokioEventLoop::new().unwrap();
        let (client, _server) = connected_pair();
        let fd = client.as_raw_fd();
        let fired = Arc::new(AtomicBool::new(false));

        event_loop.attach(client.as_fd()).unwrap();
        let flag = Arc::clone(&fired);
        event_loop
            .on_writable(fd, Box::new(move |_| flag.store(true, Ordering::SeqCst)))
            .unwrap();
        event_loop.cancel_writable(fd).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));

        // Interest can be registered again after cancellation.
        event_loop.on_writable(fd, Box::new(|_| {})).unwrap();
        event_loop.detach(fd).unwrap();
    }
}
