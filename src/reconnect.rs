//! Delayed reconnect attempts.
//!
//! At most one reconnect is pending at any time. A timer that fires clears
//! its own marker before running the attempt, so a failure of that attempt
//! can schedule the next one.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{runtime::Handle, task::JoinHandle};

#[derive(Debug)]
struct Pending {
    id: u64,
    task: JoinHandle<()>,
}

/// Owns the single pending reconnect timer.
#[derive(Debug)]
pub struct ReconnectScheduler {
    runtime: Handle,
    pending: Arc<Mutex<Option<Pending>>>,
    next_id: AtomicU64,
}

fn lock(pending: &Mutex<Option<Pending>>) -> MutexGuard<'_, Option<Pending>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReconnectScheduler {
    /// Creates a scheduler whose timers run on `runtime`.
    ///
    /// Taking a handle instead of using the ambient runtime lets callers
    /// schedule from threads that are not runtime workers.
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `reconnect` once after `delay`, unless a reconnect is already
    /// pending. Returns whether a timer was armed.
    pub fn schedule_after<F>(&self, delay: Duration, reconnect: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = lock(&self.pending);
        if pending.is_some() {
            trace!("reconnect already pending");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(&self.pending);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut pending = lock(&slot);
                if pending.as_ref().is_none_or(|pending| pending.id != id) {
                    // Cancelled or superseded between wake-up and lock.
                    return;
                }
                pending.take();
            }

            reconnect();
        });

        debug!("reconnecting in {}s", delay.as_secs());
        *pending = Some(Pending { id, task });
        true
    }

    /// Cancels the pending reconnect, if any. Returns whether one was
    /// pending.
    pub fn cancel_pending(&self) -> bool {
        match lock(&self.pending).take() {
            Some(pending) => {
                pending.task.abort();
                trace!("cancelled pending reconnect");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
