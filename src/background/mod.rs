//! Background jobs — periodic Tokio tasks tied to the lifetime of their owner.
//!
//! A periodic job holds only a [`Weak`] reference to the state it works on, so
//! it never keeps that state alive: once the owner is dropped the next tick
//! finds nothing to upgrade and the task ends by itself. Owners that want the
//! job gone immediately keep its handle in a [`TaskSet`] and call
//! [`TaskSet::abort_all`] (or simply drop the set).

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Runs `job` every `interval` for as long as `target` is alive.
///
/// The first run happens one full interval after the call. Ticks that are
/// missed because a run took too long are skipped rather than bunched up.
/// Returns `None` without spawning anything when `interval` is zero.
pub fn every<T, F, Fut>(
    name: &'static str,
    interval: Duration,
    target: Weak<T>,
    job: F,
) -> Option<JoinHandle<()>>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                trace!(job = name, "owner dropped, stopping periodic job");
                break;
            };
            job(target).await;
        }
    }))
}

/// Handles of background tasks that are aborted together.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task; `None` (a disabled job) is ignored.
    pub fn push(&self, handle: Option<JoinHandle<()>>) {
        if let Some(handle) = handle {
            self.handles.lock().push(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts every task in the set.
    pub fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}
