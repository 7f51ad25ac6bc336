//! Per-route server connection pools.
//!
//! Each route owns one [`RoutePool`]. Server connections are bounded by
//! the route's `pool_size` and reused across clients; concurrently
//! admitted clients are bounded by its `client_max`.
//!
//! # Architecture
//!
//! ```text
//! client admitted (RoutePool::admit)        -> ClientSlot
//!   RoutePool::checkout(ctx)
//!     -> wait for a free slot (pool_timeout, cancellation)
//!     -> idle connection younger than ttl   -> Lease
//!     -> otherwise ServerConnector::connect -> Lease
//!   RoutePool::release(lease) -> idle set
//!   RoutePool::discard(lease) -> closed
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pgmux_machine::{Connection, Context, MachineError, SockAddr, Transport};
use pgmux_scheme::{RouteSpec, ServerSpec, Topology};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RouterError, RouterResult};

// ── Connector ────────────────────────────────────────────────────────

/// Future returned by [`ServerConnector::connect`].
pub type Connecting<'a> = Pin<Box<dyn Future<Output = RouterResult<Transport>> + Send + 'a>>;

/// Opens server connections for a pool. Injected so pools can be tested
/// without a database.
pub trait ServerConnector: Send + Sync {
    fn connect<'a>(&'a self, ctx: &'a Context, server: &'a ServerSpec) -> Connecting<'a>;
}

/// Connects through the machine's connect state machine, upgrading to TLS
/// according to the server's policy.
#[derive(Clone, Debug)]
pub struct MachineConnector {
    timeout: Duration,
}

impl MachineConnector {
    /// `timeout` bounds each connect; zero waits indefinitely.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for MachineConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ServerConnector for MachineConnector {
    fn connect<'a>(&'a self, ctx: &'a Context, server: &'a ServerSpec) -> Connecting<'a> {
        Box::pin(async move {
            let addr = server_addr(server).await?;
            let mut conn = Connection::with_tls(server.tls_policy());
            let wrap = |source: MachineError| RouterError::Connect {
                server: server.name.clone(),
                source,
            };
            conn.connect(ctx, &addr, self.timeout).await.map_err(wrap)?;
            let transport = conn.into_transport().map_err(wrap)?;
            debug!(
                server = %server.name,
                tls = transport.is_tls(),
                "server connection established"
            );
            Ok(transport)
        })
    }
}

/// Socket address of a server. A host starting with `/` names the
/// directory of the server's unix socket.
pub async fn server_addr(server: &ServerSpec) -> RouterResult<SockAddr> {
    let resolve_err = |source| RouterError::Resolve {
        server: server.name.clone(),
        source,
    };
    if server.host.starts_with('/') {
        let path = format!("{}/.s.PGSQL.{}", server.host.trim_end_matches('/'), server.port);
        return SockAddr::unix(path).map_err(resolve_err);
    }
    let mut addrs = tokio::net::lookup_host((server.host.as_str(), server.port))
        .await
        .map_err(resolve_err)?;
    let addr: SocketAddr = addrs.next().ok_or_else(|| {
        resolve_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses for '{}'", server.host),
        ))
    })?;
    Ok(SockAddr::from(addr))
}

// ── Pool state ───────────────────────────────────────────────────────

/// A server connection with tracking metadata.
#[derive(Debug)]
struct PooledConnection {
    id: u64,
    created_at: Instant,
    /// When the connection was last returned to the idle set.
    last_used: Instant,
    transport: Transport,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<PooledConnection>,
    /// Connections in existence, idle or leased.
    total: usize,
    wait_count: u64,
}

/// Pool statistics for one route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently leased to clients.
    pub active: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Total connections (active + idle).
    pub total: usize,
    /// Clients currently admitted to the route.
    pub clients: usize,
    /// Checkouts that gave up waiting for a free connection.
    pub wait_count: u64,
}

struct Shared {
    route: Arc<RouteSpec>,
    connector: Arc<dyn ServerConnector>,
    state: Mutex<PoolState>,
    /// One permit per connection that may still be leased.
    slots: Arc<Semaphore>,
    clients: AtomicUsize,
    next_id: AtomicU64,
    draining: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a connection that will not come back to the idle set.
    fn close(&self, conn: PooledConnection, reason: &'static str) {
        let mut state = self.state();
        state.total = state.total.saturating_sub(1);
        debug!(
            route = %self.route.target,
            connection = conn.id,
            total = state.total,
            reason,
            "server connection closed"
        );
    }
}

// ── RoutePool ────────────────────────────────────────────────────────

/// Bounded pool of server connections for one route.
#[derive(Clone)]
pub struct RoutePool {
    shared: Arc<Shared>,
}

impl RoutePool {
    pub fn new(route: Arc<RouteSpec>, connector: Arc<dyn ServerConnector>) -> Self {
        // Zero means no limit.
        let permits = match route.pool_size {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };
        Self {
            shared: Arc::new(Shared {
                route,
                connector,
                state: Mutex::new(PoolState::default()),
                slots: Arc::new(Semaphore::new(permits)),
                clients: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn route(&self) -> &Arc<RouteSpec> {
        &self.shared.route
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Relaxed)
    }

    /// Admit one client to the route. The slot is held until dropped.
    /// A `client_max` of zero admits everyone.
    pub fn admit(&self) -> RouterResult<ClientSlot> {
        let route = &self.shared.route;
        let max = route.client_max as usize;
        let admitted = self
            .shared
            .clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            });
        match admitted {
            Ok(n) => {
                debug!(route = %route.target, clients = n + 1, "client admitted");
                Ok(ClientSlot {
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(_) => {
                warn!(route = %route.target, client_max = route.client_max, "client limit reached");
                Err(RouterError::ClientLimit {
                    route: route.target.clone(),
                    max: route.client_max,
                })
            }
        }
    }

    /// Lease a server connection for the coroutine behind `ctx`.
    ///
    /// An idle connection that has not outlived the route `ttl` is reused;
    /// otherwise a new one is opened. When `pool_size` connections are
    /// leased, waits up to `pool_timeout` milliseconds (zero waits
    /// indefinitely) for one to be returned.
    pub async fn checkout(&self, ctx: &Context) -> RouterResult<Lease> {
        let shared = &self.shared;
        let route = &shared.route;
        if self.is_draining() {
            return Err(RouterError::Draining(route.target.clone()));
        }

        let permit = self.acquire_slot(ctx).await?;

        if let Some(conn) = self.take_idle() {
            debug!(route = %route.target, connection = conn.id, "reused idle server connection");
            return Ok(Lease::new(Arc::clone(shared), conn, permit));
        }

        let transport = shared.connector.connect(ctx, &route.server).await?;
        let now = Instant::now();
        let conn = PooledConnection {
            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
            created_at: now,
            last_used: now,
            transport,
        };
        let total = {
            let mut state = shared.state();
            state.total += 1;
            state.total
        };
        debug!(
            route = %route.target,
            server = %route.server.name,
            connection = conn.id,
            total,
            "created server connection"
        );
        Ok(Lease::new(Arc::clone(shared), conn, permit))
    }

    async fn acquire_slot(&self, ctx: &Context) -> RouterResult<OwnedSemaphorePermit> {
        let shared = &self.shared;
        let route = &shared.route;
        let acquire = Arc::clone(&shared.slots).acquire_owned();
        let wait = async {
            if route.pool_timeout == 0 {
                Some(acquire.await)
            } else {
                let limit = Duration::from_millis(u64::from(route.pool_timeout));
                tokio::time::timeout(limit, acquire).await.ok()
            }
        };

        let acquired = tokio::select! {
            biased;
            _ = ctx.coroutine().cancelled() => return Err(MachineError::Cancelled.into()),
            acquired = wait => acquired,
        };
        match acquired {
            Some(Ok(permit)) => Ok(permit),
            // The semaphore is never closed while the pool exists.
            Some(Err(_)) => Err(RouterError::Draining(route.target.clone())),
            None => {
                shared.state().wait_count += 1;
                warn!(
                    route = %route.target,
                    pool_size = route.pool_size,
                    pool_timeout = route.pool_timeout,
                    "server pool exhausted"
                );
                Err(RouterError::PoolExhausted {
                    route: route.target.clone(),
                    timeout_ms: route.pool_timeout,
                })
            }
        }
    }

    /// Pop the most recently returned idle connection, closing any that
    /// outlived the route `ttl` on the way.
    fn take_idle(&self) -> Option<PooledConnection> {
        let ttl = Duration::from_secs(u64::from(self.shared.route.ttl));
        loop {
            let conn = self.shared.state().idle.pop()?;
            if ttl.is_zero() || conn.last_used.elapsed() < ttl {
                return Some(conn);
            }
            self.shared.close(conn, "ttl expired");
        }
    }

    /// Return a leased connection to the idle set. Connections marked
    /// unhealthy, or released while draining, are closed instead.
    pub fn release(&self, mut lease: Lease) {
        let Some(mut conn) = lease.conn.take() else {
            return;
        };
        if !lease.healthy || self.is_draining() {
            self.shared.close(conn, "released unhealthy or draining");
            return;
        }
        conn.last_used = Instant::now();
        let mut state = self.shared.state();
        debug!(
            route = %self.shared.route.target,
            connection = conn.id,
            idle = state.idle.len() + 1,
            "returned server connection to pool"
        );
        state.idle.push(conn);
    }

    /// Close a leased connection and free its slot.
    pub fn discard(&self, mut lease: Lease) {
        if let Some(conn) = lease.conn.take() {
            self.shared.close(conn, "discarded");
        }
    }

    /// Close every idle connection. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let idle: Vec<_> = {
            let mut state = self.shared.state();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            active: state.total.saturating_sub(state.idle.len()),
            idle: state.idle.len(),
            total: state.total,
            clients: self.shared.clients.load(Ordering::Acquire),
            wait_count: state.wait_count,
        }
    }
}

impl std::fmt::Debug for RoutePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePool")
            .field("route", &self.shared.route.target)
            .field("stats", &self.stats())
            .field("draining", &self.is_draining())
            .finish_non_exhaustive()
    }
}

// ── Lease ────────────────────────────────────────────────────────────

/// Behaviour flags of the route a lease came from, consumed by the
/// protocol layer when the client detaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteFlags {
    pub cancel: bool,
    pub discard: bool,
    pub rollback: bool,
}

/// A server connection checked out of a [`RoutePool`].
///
/// Give it back with [`RoutePool::release`] or [`RoutePool::discard`].
/// Dropping a lease closes the connection.
pub struct Lease {
    shared: Arc<Shared>,
    conn: Option<PooledConnection>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    fn new(shared: Arc<Shared>, conn: PooledConnection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            shared,
            conn: Some(conn),
            healthy: true,
            _permit: permit,
        }
    }

    /// Connection id, unique within the pool.
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }

    /// Age of the underlying server connection.
    pub fn age(&self) -> Duration {
        self.conn
            .as_ref()
            .map_or(Duration::ZERO, |c| c.created_at.elapsed())
    }

    pub fn transport(&mut self) -> Option<&mut Transport> {
        self.conn.as_mut().map(|c| &mut c.transport)
    }

    pub fn flags(&self) -> RouteFlags {
        let route = &self.shared.route;
        RouteFlags {
            cancel: route.cancel,
            discard: route.discard,
            rollback: route.rollback,
        }
    }

    /// Keep the connection out of the idle set on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.close(conn, "lease dropped");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("route", &self.shared.route.target)
            .field("id", &self.id())
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// An admitted client. Dropping it frees the admission slot.
pub struct ClientSlot {
    shared: Arc<Shared>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.shared.clients.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSlot")
            .field("route", &self.shared.route.target)
            .finish()
    }
}

// ── PoolManager ──────────────────────────────────────────────────────

/// One [`RoutePool`] per route of a topology.
#[derive(Debug)]
pub struct PoolManager {
    pools: HashMap<String, RoutePool>,
}

impl PoolManager {
    pub fn new(topology: &Topology, connector: Arc<dyn ServerConnector>) -> Self {
        let pools = topology
            .routes()
            .iter()
            .map(|route| {
                let pool = RoutePool::new(Arc::clone(route), Arc::clone(&connector));
                (route.target.clone(), pool)
            })
            .collect();
        Self { pools }
    }

    pub fn pool(&self, target: &str) -> Option<&RoutePool> {
        self.pools.get(target)
    }

    /// Stop handing out connections and close every idle one. Leased
    /// connections are closed as they come back. Returns the number of
    /// connections closed now.
    pub fn drain(&self) -> usize {
        let mut closed = 0;
        for pool in self.pools.values() {
            pool.shared.draining.store(true, Ordering::Relaxed);
            closed += pool.close_idle();
        }
        info!(closed, pools = self.pools.len(), "server pools drained");
        closed
    }

    /// Statistics of every pool, sorted by route target.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<_> = self
            .pools
            .iter()
            .map(|(target, pool)| (target.clone(), pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Log pool statistics for all pools at `info` level.
    pub fn log_stats(&self) {
        for (target, stats) in self.stats() {
            info!(
                route = %target,
                active = stats.active,
                idle = stats.idle,
                total = stats.total,
                clients = stats.clients,
                wait_count = stats.wait_count,
                "pool statistics"
            );
        }
    }
}
