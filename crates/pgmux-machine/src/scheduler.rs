//! Coroutine scheduling over per-worker tokio runtimes.
//!
//! A [`Machine`] is one worker: a dedicated OS thread driving a
//! current-thread runtime with its own event loop. Coroutines spawned
//! through its [`Scheduler`] run cooperatively on that thread and receive
//! an explicit [`Context`] instead of reaching for an ambient "current
//! machine". [`MachinePool`] starts several machines and hands their
//! schedulers out round-robin; there is no work stealing between them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coroutine::Coroutine;
use crate::error::{MachineError, MachineResult};
use crate::event_loop::{EventLoop, TokioEventLoop};

// ── Context ──────────────────────────────────────────────────────────

/// Handle passed into every operation that may suspend.
#[derive(Clone)]
pub struct Context {
    coroutine: Coroutine,
    event_loop: Arc<dyn EventLoop>,
}

impl Context {
    pub fn new(coroutine: Coroutine, event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            coroutine,
            event_loop,
        }
    }

    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("coroutine", &self.coroutine.id())
            .finish_non_exhaustive()
    }
}

// ── Scheduler ────────────────────────────────────────────────────────

/// Spawns coroutines onto one worker.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    event_loop: Arc<dyn EventLoop>,
}

impl Scheduler {
    pub fn new(handle: Handle, event_loop: Arc<dyn EventLoop>) -> Self {
        Self { handle, event_loop }
    }

    /// Scheduler for the runtime the caller is running on, with a fresh
    /// production event loop.
    pub fn current() -> MachineResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| MachineError::Worker(format!("no runtime: {e}")))?;
        let event_loop = Arc::new(TokioEventLoop::with_handle(handle.clone()));
        Ok(Self::new(handle, event_loop))
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }

    /// Spawn a coroutine. `f` receives the coroutine's [`Context`].
    pub fn spawn<F, Fut, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let coroutine = Coroutine::new();
        let ctx = Context::new(coroutine.clone(), Arc::clone(&self.event_loop));
        let join = self.handle.spawn(f(ctx));
        debug!(coroutine = %coroutine.id(), "coroutine spawned");
        Task { coroutine, join }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// A spawned coroutine.
#[derive(Debug)]
pub struct Task<T> {
    coroutine: Coroutine,
    join: JoinHandle<T>,
}

impl<T> Task<T> {
    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) -> bool {
        self.coroutine.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the coroutine to return.
    pub async fn join(self) -> MachineResult<T> {
        let id = self.coroutine.id();
        self.join
            .await
            .map_err(|e| MachineError::Worker(format!("coroutine {id} did not finish: {e}")))
    }
}

// ── Machine ──────────────────────────────────────────────────────────

/// One worker thread with its own runtime, event loop and scheduler.
pub struct Machine {
    name: String,
    scheduler: Scheduler,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Machine {
    /// Start the worker thread and wait until its runtime is up.
    pub fn start(name: impl Into<String>) -> MachineResult<Self> {
        let name = name.into();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Scheduler, String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("runtime: {e}")));
                        return;
                    }
                };
                let handle = runtime.handle().clone();
                let event_loop = Arc::new(TokioEventLoop::with_handle(handle.clone()));
                if ready_tx.send(Ok(Scheduler::new(handle, event_loop))).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                // Dropping the runtime drops every coroutine still parked on it.
            })
            .map_err(|e| MachineError::Worker(format!("{name}: {e}")))?;

        let scheduler = ready_rx
            .recv()
            .map_err(|_| MachineError::Worker(format!("{name}: thread exited during start")))?
            .map_err(|e| MachineError::Worker(format!("{name}: {e}")))?;

        info!(machine = %name, "machine started");
        Ok(Self {
            name,
            scheduler,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stop the worker and wait for its thread to exit.
    pub fn shutdown(mut self) -> MachineResult<()> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> MachineResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| MachineError::Worker(format!("{}: thread panicked", self.name)))?;
            info!(machine = %self.name, "machine stopped");
        }
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if let Err(err) = self.stop_thread() {
            warn!(machine = %self.name, error = %err, "machine stop failed");
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

// ── MachinePool ──────────────────────────────────────────────────────

/// A fixed set of machines.
#[derive(Debug)]
pub struct MachinePool {
    machines: Vec<Machine>,
    next: AtomicUsize,
}

impl MachinePool {
    /// Start `workers` machines named `worker-0`, `worker-1`, ...
    pub fn start(workers: usize) -> MachineResult<Self> {
        if workers == 0 {
            return Err(MachineError::Worker("at least one worker is required".into()));
        }
        let machines = (0..workers)
            .map(|i| Machine::start(format!("worker-{i}")))
            .collect::<MachineResult<Vec<_>>>()?;
        Ok(Self {
            machines,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Scheduler of the next machine, round-robin.
    pub fn next(&self) -> &Scheduler {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.machines.len();
        self.machines[i].scheduler()
    }

    /// Stop every machine. Reports the first failure after stopping all.
    pub fn shutdown(self) -> MachineResult<()> {
        let mut first_error = None;
        for machine in self.machines {
            if let Err(err) = machine.shutdown() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
