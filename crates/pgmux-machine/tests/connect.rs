//! Connect state machine tests.
//!
//! Most tests drive the machine through a recording fake event loop so
//! that readiness, cancellation and timeouts can be sequenced exactly.
//! "In progress" connects are produced by a listener whose accept queue is
//! full: the kernel drops further SYNs, so the connect stays pending.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pgmux_machine::{
    Connection, Context, Coroutine, EventLoop, MachineError, Scheduler, SockAddr,
    TokioEventLoop, WriteCallback,
};
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

// ── Fake event loop ──────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    attached: HashMap<RawFd, OwnedFd>,
    pending: HashMap<RawFd, WriteCallback>,
    /// Callbacks whose registration was cancelled, kept to simulate late firing.
    cancelled: Vec<WriteCallback>,
    attach_calls: usize,
    register_calls: usize,
    cancel_calls: usize,
    detach_calls: usize,
    fail_attach: bool,
    fail_register: bool,
}

#[derive(Default)]
struct FakeLoop {
    state: Mutex<FakeState>,
    registered: Notify,
}

impl FakeLoop {
    fn failing_attach() -> Arc<Self> {
        let fake = Self::default();
        fake.state.lock().unwrap().fail_attach = true;
        Arc::new(fake)
    }

    fn failing_register() -> Arc<Self> {
        let fake = Self::default();
        fake.state.lock().unwrap().fail_register = true;
        Arc::new(fake)
    }

    fn counts(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.attach_calls,
            state.register_calls,
            state.cancel_calls,
            state.detach_calls,
        )
    }

    fn residual(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.attached.len(), state.pending.len())
    }

    /// Fire every pending write callback with its descriptor.
    fn fire_pending(&self) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<_> = state.pending.drain().collect();
        for (fd, callback) in pending {
            let watched = state.attached.get(&fd).expect("pending fd is attached");
            callback(watched.as_fd());
        }
    }

    /// Fire callbacks that were already unregistered, using `fd`.
    fn fire_cancelled(&self, fd: BorrowedFd<'_>) {
        let cancelled = std::mem::take(&mut self.state.lock().unwrap().cancelled);
        for callback in cancelled {
            callback(fd);
        }
    }
}

impl EventLoop for FakeLoop {
    fn attach(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.attach_calls += 1;
        if state.fail_attach {
            return Err(io::Error::other("attach refused"));
        }
        let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);
        state.attached.insert(raw, fd.try_clone_to_owned()?);
        Ok(())
    }

    fn on_writable(&self, fd: RawFd, callback: WriteCallback) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.register_calls += 1;
        if state.fail_register {
            return Err(io::Error::other("register refused"));
        }
        if !state.attached.contains_key(&fd) {
            return Err(io::ErrorKind::NotFound.into());
        }
        state.pending.insert(fd, callback);
        drop(state);
        self.registered.notify_one();
        Ok(())
    }

    fn cancel_writable(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls += 1;
        if let Some(callback) = state.pending.remove(&fd) {
            state.cancelled.push(callback);
        }
        Ok(())
    }

    fn detach(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.detach_calls += 1;
        state.pending.remove(&fd);
        state
            .attached
            .remove(&fd)
            .map(drop)
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// A TCP address whose connects stay in progress.
struct Blackhole {
    addr: SockAddr,
    _listener: Socket,
    _fillers: Vec<Socket>,
}

fn blackhole() -> Blackhole {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&any.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    let fillers = (0..8)
        .map(|_| {
            let filler = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
            filler.set_nonblocking(true).unwrap();
            let _ = filler.connect(&addr);
            filler
        })
        .collect();
    std::thread::sleep(Duration::from_millis(50));

    Blackhole {
        addr,
        _listener: listener,
        _fillers: fillers,
    }
}

fn fake_context(fake: &Arc<FakeLoop>) -> Context {
    let event_loop: Arc<dyn EventLoop> = fake.clone();
    Context::new(Coroutine::new(), event_loop)
}

// ── Fast path ────────────────────────────────────────────────────────

#[tokio::test]
async fn synchronous_connect_never_registers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.sock");
    let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    let addr = SockAddr::unix(&path).unwrap();

    let fake = Arc::new(FakeLoop::default());
    let ctx = fake_context(&fake);
    let mut conn = Connection::new();
    conn.connect(&ctx, &addr, Duration::from_secs(1)).await.unwrap();

    assert!(conn.is_connected());
    assert!(!conn.is_attached());
    assert!(conn.fd().is_some());
    assert_eq!(conn.errno(), 0);
    assert_eq!(fake.counts(), (0, 0, 0, 0));
}

// ── Preconditions ────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_coroutine_is_rejected_up_front() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let ctx = fake_context(&fake);
    ctx.coroutine().cancel();

    let mut conn = Connection::new();
    let err = conn.connect(&ctx, &hole.addr, Duration::ZERO).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(conn.errno(), libc::ECANCELED);
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (0, 0, 0, 0));
}

#[tokio::test]
async fn second_connect_on_connected_io_is_rejected() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = SockAddr::from(listener.local_addr().unwrap());
    let ctx = Context::new(Coroutine::new(), Arc::new(TokioEventLoop::new().unwrap()));

    let mut conn = Connection::new();
    conn.connect(&ctx, &addr, Duration::from_secs(2)).await.unwrap();
    let fd = conn.fd();

    let err = conn.connect(&ctx, &addr, Duration::from_secs(2)).await.unwrap_err();
    assert!(matches!(err, MachineError::AlreadyConnected));
    assert_eq!(conn.errno(), libc::EINPROGRESS);
    assert!(conn.is_connected());
    assert_eq!(conn.fd(), fd, "existing socket untouched");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_while_waiting_detaches_everything() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let event_loop: Arc<dyn EventLoop> = fake.clone();
    let scheduler = Scheduler::new(tokio::runtime::Handle::current(), event_loop);

    let addr = hole.addr.clone();
    let task = scheduler.spawn(move |ctx| async move {
        let mut conn = Connection::new();
        let result = conn.connect(&ctx, &addr, Duration::ZERO).await;
        (conn, result)
    });

    fake.registered.notified().await;
    task.cancel();
    let (conn, result) = task.join().await.unwrap();

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(conn.errno(), libc::ECANCELED);
    assert!(!conn.is_connected());
    assert!(!conn.is_attached());
    assert!(!conn.connect_timed_out());
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (1, 1, 1, 1));
    assert_eq!(fake.residual(), (0, 0));
}

#[tokio::test]
async fn dropping_the_connect_future_cleans_up() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let ctx = fake_context(&fake);

    let mut conn = Connection::new();
    let waited = tokio::time::timeout(
        Duration::from_millis(20),
        conn.connect(&ctx, &hole.addr, Duration::ZERO),
    )
    .await;
    assert!(waited.is_err());

    assert_eq!(conn.fd(), None);
    assert!(!conn.is_attached());
    assert_eq!(fake.counts(), (1, 1, 1, 1));
    assert_eq!(fake.residual(), (0, 0));
}

// ── Timeout ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timeout_fires_after_deadline_and_late_callback_is_ignored() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let ctx = fake_context(&fake);

    let started = tokio::time::Instant::now();
    let mut conn = Connection::new();
    let err = conn
        .connect(&ctx, &hole.addr, Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(conn.connect_timed_out());
    assert_eq!(conn.errno(), libc::ETIMEDOUT);
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (1, 1, 1, 1));
    assert_eq!(fake.residual(), (0, 0));

    // The readiness callback shows up after the coroutine moved on.
    let (late, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
    fake.fire_cancelled(late.as_fd());
    assert!(conn.connect_timed_out());
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn late_callback_from_timed_out_attempt_cannot_complete_a_retry() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let event_loop: Arc<dyn EventLoop> = fake.clone();
    let scheduler = Scheduler::new(tokio::runtime::Handle::current(), event_loop);

    let mut conn = Connection::new();
    let err = conn
        .connect(&fake_context(&fake), &hole.addr, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    // Consume the wakeup stored by the first registration.
    fake.registered.notified().await;

    let addr = hole.addr.clone();
    let task = scheduler.spawn(move |ctx| async move {
        let result = conn.connect(&ctx, &addr, Duration::from_secs(30)).await;
        (conn, result)
    });
    fake.registered.notified().await;

    // The first attempt's readiness callback arrives during the retry.
    let (late, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
    fake.fire_cancelled(late.as_fd());
    tokio::task::yield_now().await;
    assert!(!task.is_finished());

    task.cancel();
    let (conn, result) = task.join().await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
    assert!(!conn.is_connected());
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (2, 2, 2, 2));
    assert_eq!(fake.residual(), (0, 0));
}

// ── Completion ───────────────────────────────────────────────────────

#[tokio::test]
async fn readiness_with_clean_status_connects_and_drop_detaches() {
    let hole = blackhole();
    let fake = Arc::new(FakeLoop::default());
    let event_loop: Arc<dyn EventLoop> = fake.clone();
    let scheduler = Scheduler::new(tokio::runtime::Handle::current(), event_loop);

    let addr = hole.addr.clone();
    let task = scheduler.spawn(move |ctx| async move {
        let mut conn = Connection::new();
        let result = conn.connect(&ctx, &addr, Duration::from_secs(30)).await;
        (conn, result)
    });

    fake.registered.notified().await;
    // SYN still unanswered, so SO_ERROR reads 0.
    fake.fire_pending();
    let (conn, result) = task.join().await.unwrap();

    result.unwrap();
    assert!(conn.is_connected());
    assert!(conn.is_attached());
    assert_eq!(fake.counts(), (1, 1, 1, 0));

    drop(conn);
    assert_eq!(fake.counts().3, 1);
    assert_eq!(fake.residual(), (0, 0));
}

// ── Resource errors ──────────────────────────────────────────────────

#[tokio::test]
async fn attach_failure_closes_the_socket() {
    let hole = blackhole();
    let fake = FakeLoop::failing_attach();
    let ctx = fake_context(&fake);

    let mut conn = Connection::new();
    let err = conn.connect(&ctx, &hole.addr, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, MachineError::Attach(_)));
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (1, 0, 0, 0));
}

#[tokio::test]
async fn register_failure_detaches_and_closes() {
    let hole = blackhole();
    let fake = FakeLoop::failing_register();
    let ctx = fake_context(&fake);

    let mut conn = Connection::new();
    let err = conn.connect(&ctx, &hole.addr, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, MachineError::Register(_)));
    assert!(!conn.is_attached());
    assert_eq!(conn.fd(), None);
    assert_eq!(fake.counts(), (1, 1, 0, 1));
    assert_eq!(fake.residual(), (0, 0));
}

// ── Production event loop ────────────────────────────────────────────

#[tokio::test]
async fn tokio_loop_connects_and_hands_over_the_stream() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = SockAddr::from(listener.local_addr().unwrap());
    let event_loop = Arc::new(TokioEventLoop::new().unwrap());
    let ctx = Context::new(Coroutine::new(), event_loop.clone());

    let mut conn = Connection::new();
    conn.connect(&ctx, &addr, Duration::from_secs(2)).await.unwrap();
    assert!(conn.is_connected());

    let mut transport = conn.into_transport().unwrap();
    assert!(!transport.is_tls());
    assert_eq!(event_loop.attached_count(), 0);

    let (mut server, _) = listener.accept().await.unwrap();
    transport.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn tokio_loop_reports_refused_connection() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let addr = SockAddr::from(SocketAddr::from(([127, 0, 0, 1], port)));
    let event_loop = Arc::new(TokioEventLoop::new().unwrap());
    let ctx = Context::new(Coroutine::new(), event_loop.clone());

    let mut conn = Connection::new();
    let err = conn.connect(&ctx, &addr, Duration::from_secs(2)).await.unwrap_err();

    // Loopback may refuse synchronously or through SO_ERROR.
    assert!(matches!(
        err,
        MachineError::Connect { .. } | MachineError::Socket(_)
    ));
    assert_eq!(conn.errno(), libc::ECONNREFUSED);
    assert!(!conn.connect_timed_out());
    assert_eq!(conn.fd(), None);
    assert_eq!(event_loop.attached_count(), 0);
}
