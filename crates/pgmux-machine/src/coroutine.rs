//! Coroutine identity and cooperative cancellation.
//!
//! A coroutine is a tokio task spawned through the [`Scheduler`]. The
//! [`Coroutine`] handle carries its identity and a sticky cancellation
//! flag. Cancellation is only observed at checkpoints: the precondition
//! check of `connect` and the wait inside [`Call::activate`].
//!
//! [`Scheduler`]: crate::Scheduler
//! [`Call::activate`]: crate::Call::activate

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique coroutine identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u64);

impl CoroutineId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co-{}", self.0)
    }
}

/// Handle to a coroutine: identity plus cancellation flag.
///
/// Clones share the same flag, so the owner can keep one clone to
/// request shutdown while the coroutine holds another.
#[derive(Clone, Debug)]
pub struct Coroutine {
    id: CoroutineId,
    cancel: Arc<watch::Sender<bool>>,
}

impl Coroutine {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: CoroutineId::next(),
            cancel: Arc::new(cancel),
        }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Request cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        let changed = self.cancel.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if changed {
            tracing::debug!(coroutine = %self.id, "cancellation requested");
        }
        changed
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested.
    ///
    /// Resolves immediately if the coroutine is already cancelled, so a
    /// cancel issued before anyone waits is never lost.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // The sender lives as long as `self`; unreachable in practice.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Self::new()
    }
}
