//! The Call primitive: one outstanding suspension of a coroutine.
//!
//! A [`Call`] suspends its coroutine inside [`Call::activate`] until
//! exactly one of three sources resolves it:
//!
//! - **completion**: a [`CallResolver`] (typically held by an event-loop
//!   callback) delivers a status code,
//! - **timeout**: the timer armed by `activate` fires,
//! - **abort**: the coroutine is cancelled, or someone calls
//!   [`Call::abort`] / [`CallResolver::abort`].
//!
//! Resolution is first-writer-wins under the state mutex. Whoever finds
//! the Call still active performs the transition and deactivates it; every
//! later attempt observes it inactive and becomes a no-op. A late
//! completion therefore never overwrites a timeout or an abort, and never
//! wakes a coroutine that has already moved on.
//!
//! Every activation has its own generation. A resolver is bound to one
//! generation, so a callback left over from an earlier attempt cannot
//! resolve a later one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::coroutine::{Coroutine, CoroutineId};
use crate::error::{MachineError, MachineResult};

/// How a Call was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with a status code; 0 means success.
    Completed(i32),
    TimedOut,
    Aborted,
}

#[derive(Debug, Default)]
struct CallState {
    active: bool,
    /// `None` is the "no result" sentinel.
    status: Option<i32>,
    timed_out: bool,
    aborted: bool,
    wake: Option<oneshot::Sender<()>>,
    owner: Option<CoroutineId>,
    /// Number of activations so far; the current one when active.
    generation: u64,
}

impl CallState {
    /// Apply a resolution if the Call is still active.
    fn resolve(&mut self, outcome: Outcome) -> bool {
        if !self.active {
            return false;
        }
        match outcome {
            Outcome::Completed(status) => self.status = Some(status),
            Outcome::TimedOut => self.timed_out = true,
            Outcome::Aborted => self.aborted = true,
        }
        self.active = false;
        if let Some(wake) = self.wake.take() {
            // The waiter may already be gone; the state is authoritative.
            let _ = wake.send(());
        }
        if let Some(owner) = self.owner {
            tracing::debug!(coroutine = %owner, outcome = ?outcome, "call resolved");
        }
        true
    }

    /// Resolution on behalf of a resolver bound to `generation`.
    fn resolve_for(&mut self, generation: u64, outcome: Outcome) -> bool {
        if generation != self.generation {
            return false;
        }
        self.resolve(outcome)
    }

    fn outcome(&self) -> Option<Outcome> {
        if self.active {
            return None;
        }
        if let Some(status) = self.status {
            Some(Outcome::Completed(status))
        } else if self.timed_out {
            Some(Outcome::TimedOut)
        } else if self.aborted {
            Some(Outcome::Aborted)
        } else {
            None
        }
    }
}

fn lock(shared: &Mutex<CallState>) -> MutexGuard<'_, CallState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single-resolution synchronization point.
///
/// Owned by the io object it serves. The state sits behind an `Arc` only
/// so that resolvers can outlive the borrow of the Call itself.
#[derive(Debug, Default)]
pub struct Call {
    shared: Arc<Mutex<CallState>>,
}

impl Call {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle bound to the in-flight activation, or to the next one
    /// when the Call is idle.
    pub fn resolver(&self) -> CallResolver {
        let state = lock(&self.shared);
        let generation = if state.active {
            state.generation
        } else {
            state.generation + 1
        };
        CallResolver {
            shared: Arc::clone(&self.shared),
            generation,
        }
    }

    /// Suspend `coroutine` until the Call is resolved.
    ///
    /// A zero `timeout` waits indefinitely. Fails with
    /// [`MachineError::AlreadyActive`] if another activation is in flight;
    /// the in-flight one is left untouched. If the returned future is
    /// dropped before resolution, the Call is resolved as aborted.
    pub async fn activate(
        &self,
        coroutine: &Coroutine,
        timeout: Duration,
    ) -> MachineResult<Outcome> {
        let woken = {
            let mut state = lock(&self.shared);
            if state.active {
                return Err(MachineError::AlreadyActive);
            }
            let (wake, woken) = oneshot::channel();
            *state = CallState {
                active: true,
                wake: Some(wake),
                owner: Some(coroutine.id()),
                generation: state.generation + 1,
                ..CallState::default()
            };
            woken
        };
        let _abandon = AbortOnDrop {
            shared: &self.shared,
        };

        let timer = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        tokio::select! {
            biased;
            _ = woken => {}
            _ = coroutine.cancelled() => {
                lock(&self.shared).resolve(Outcome::Aborted);
            }
            _ = timer => {
                lock(&self.shared).resolve(Outcome::TimedOut);
            }
        }

        let mut state = lock(&self.shared);
        // A dropped wake sender without resolution cannot happen while the
        // state is active, but never leave the Call half-resolved.
        state.resolve(Outcome::Aborted);
        Ok(state.outcome().unwrap_or(Outcome::Aborted))
    }

    /// Resolve an in-flight activation as aborted.
    pub fn abort(&self) -> bool {
        lock(&self.shared).resolve(Outcome::Aborted)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.shared).active
    }

    /// Status delivered by the last completion, if any.
    pub fn status(&self) -> Option<i32> {
        lock(&self.shared).status
    }

    pub fn timed_out(&self) -> bool {
        lock(&self.shared).timed_out
    }

    pub fn aborted(&self) -> bool {
        lock(&self.shared).aborted
    }
}

/// Resolves the activation on drop if it is still pending.
struct AbortOnDrop<'a> {
    shared: &'a Mutex<CallState>,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        lock(self.shared).resolve(Outcome::Aborted);
    }
}

/// Clonable, `'static` handle that resolves a [`Call`] from outside the
/// waiting coroutine.
#[derive(Clone, Debug)]
pub struct CallResolver {
    shared: Arc<Mutex<CallState>>,
    generation: u64,
}

impl CallResolver {
    /// Deliver a completion status. Returns whether this resolved the Call.
    pub fn complete(&self, status: i32) -> bool {
        lock(&self.shared).resolve_for(self.generation, Outcome::Completed(status))
    }

    /// Abort the Call. Returns whether this resolved the Call.
    pub fn abort(&self) -> bool {
        lock(&self.shared).resolve_for(self.generation, Outcome::Aborted)
    }
}
