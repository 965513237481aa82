use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A deduplicating set of pending labels with an awaitable take.
///
/// Producers call [`add`](Self::add) from any thread (including non-runtime
/// threads such as the simulation loop). Consumers either empty the whole set
/// with [`drain_all`](Self::drain_all) or suspend in
/// [`await_one`](Self::await_one) until a label shows up.
///
/// A label is delivered at most once per drain cycle: adding a label that is
/// already pending is a no-op and does not wake anyone.
pub struct SignalSet<T> {
    pending: Mutex<HashSet<T>>,
    notify: Notify,
}

impl<T> Default for SignalSet<T>
where
    T: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SignalSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Create a set that already holds `labels`.
    pub fn seeded(labels: impl IntoIterator<Item = T>) -> Self {
        Self {
            pending: Mutex::new(labels.into_iter().collect()),
            notify: Notify::new(),
        }
    }

    /// Insert `label` if absent. Returns `true` if it was newly inserted.
    ///
    /// Only a fresh insertion wakes a waiter. If nobody is waiting the wakeup
    /// is stored as a permit, so a consumer that registers later still sees it.
    pub fn add(&self, label: T) -> bool {
        let inserted = self.pending.lock().insert(label);
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    /// Remove and return every pending label. Never blocks.
    pub fn drain_all(&self) -> HashSet<T> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Remove and return one arbitrary pending label, if any.
    pub fn take_one(&self) -> Option<T> {
        let mut pending = self.pending.lock();
        let label = pending.iter().next().cloned()?;
        pending.remove(&label);
        Some(label)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take one label, waiting up to `timeout` for one to arrive.
    ///
    /// Returns immediately if a label is already pending. Returns `None` when
    /// the timeout elapses with nothing to take; that is the normal "no news"
    /// outcome, not an error.
    ///
    /// The wait is cooperative (tokio `Notify` + timer), so thousands of
    /// waiters cost no OS threads.
    pub async fn await_one(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking: an `add` racing with the check below
            // either lands in the set or wakes this future.
            notified.as_mut().enable();

            if let Some(label) = self.take_and_pass_on() {
                return Some(label);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take_and_pass_on();
            }
        }
    }

    /// Take one label and, if more remain, hand a wakeup to the next waiter.
    ///
    /// `add` only wakes one waiter per insertion, and a woken waiter may find
    /// its label already drained by a concurrent consumer. Forwarding keeps
    /// other waiters from sleeping on a non-empty set.
    fn take_and_pass_on(&self) -> Option<T> {
        let mut pending = self.pending.lock();
        let label = pending.iter().next().cloned()?;
        pending.remove(&label);
        let more = !pending.is_empty();
        drop(pending);
        if more {
            self.notify.notify_one();
        }
        Some(label)
    }
}

impl<T> std::fmt::Debug for SignalSet<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSet")
            .field("pending", &*self.pending.lock())
            .finish_non_exhaustive()
    }
}
