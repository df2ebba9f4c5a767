//! In-memory backlog of pending work items shared by all workers.
//!
//! The backlog is a mutex-guarded FIFO plus a [`Notify`] used to wake workers
//! waiting in [`Backlog::pop_timeout`]. Besides the pending queue it tracks:
//!
//! - how many items are currently leased to workers (in flight)
//! - how many attempts each item has used, for the per-item attempt budget
//!
//! A pop on an empty backlog waits while other items are still in flight,
//! because a failing item may be pushed back, and returns `None` right away
//! once nothing is pending and nothing is in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::job::{RecordId, WorkItem};

/// Result of pushing a failed item back.
#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    /// The item is pending again.
    Queued { attempts: u32 },
    /// The item used its whole budget; it is handed back instead of queued.
    Exhausted { item: WorkItem, attempts: u32 },
    /// The backlog was closed; the item was dropped.
    Closed,
}

#[derive(Debug, Default)]
struct BacklogState {
    pending: VecDeque<WorkItem>,
    in_flight: usize,
    attempts: HashMap<RecordId, u32>,
    closed: bool,
}

/// Thread-safe pending-item collection with push-back on failure.
#[derive(Debug)]
pub struct Backlog {
    state: Mutex<BacklogState>,
    notify: Notify,
    /// Attempts allowed per item; `None` means unbounded.
    max_attempts: Option<u32>,
}

impl Backlog {
    /// Creates a backlog holding `items`.
    ///
    /// `max_attempts` bounds how many times one item may be leased; `None`
    /// lets failing items cycle forever.
    pub fn new(items: impl IntoIterator<Item = WorkItem>, max_attempts: Option<u32>) -> Self {
        Self {
            state: Mutex::new(BacklogState {
                pending: items.into_iter().collect(),
                ..Default::default()
            }),
            notify: Notify::new(),
            max_attempts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BacklogState> {
        // A panic while holding the lock cannot leave the queue half-updated,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the next pending item, waiting up to `wait` for one to appear.
    ///
    /// Returns `None` when the wait elapses, when the backlog is closed, or
    /// immediately when nothing is pending and nothing is in flight.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + wait;

        loop {
            // Registered before inspecting the state so a push between the
            // check and the await is not missed.
            let notified = self.notify.notified();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.pending.pop_front() {
                    state.in_flight += 1;
                    *state.attempts.entry(item.id.clone()).or_insert(0) += 1;
                    return Some(item);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Releases the lease on an item that reached a terminal state.
    pub fn finish(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Pushes a failed item back, unless it used up its attempt budget.
    pub fn requeue(&self, item: WorkItem) -> Requeue {
        let outcome = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            let attempts = state.attempts.get(&item.id).copied().unwrap_or(0);

            if state.closed {
                Requeue::Closed
            } else if self.max_attempts.is_some_and(|max| attempts >= max) {
                Requeue::Exhausted { item, attempts }
            } else {
                state.pending.push_back(item);
                Requeue::Queued { attempts }
            }
        };
        self.notify.notify_waiters();
        outcome
    }

    /// Drops all pending items and makes every pop return `None`.
    ///
    /// Returns the number of items that were still pending.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.closed = true;
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no item is pending.
    ///
    /// This can be stale as soon as it returns: another worker may push an
    /// item back right after.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Number of items currently leased to workers.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Attempts used so far by the item with `id`.
    pub fn attempts(&self, id: &RecordId) -> u32 {
        self.lock().attempts.get(id).copied().unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
