//! Pool entries and their state machine

use std::time::Instant;

use parking_lot::Mutex;

/// Lifecycle state of a pooled entry.
///
/// Legal transitions: `Initialized -> Available` (insert after prewarm or
/// scale-out), `Initialized -> Acquired` (miss-path creation),
/// `Available <-> Acquired` (acquire/release), `Acquired -> PendingRefresh`
/// (sweep flags an aged entry that is checked out),
/// `PendingRefresh -> Available` (refresh on release), and any state to
/// `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
    Initialized,
    Available,
    Acquired,
    Closed,
    PendingRefresh,
}

/// Mutable half of a slot: payload plus bookkeeping.
///
/// `object` is `Some` exactly while the entry is resident in the pool
/// (`Available`); it moves out to the acquirer and back on release.
pub(crate) struct SlotState<T> {
    pub(crate) status: EntryStatus,
    pub(crate) object: Option<T>,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
}

impl<T> SlotState<T> {
    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Resets both clocks after the payload is replaced in place.
    pub(crate) fn renew(&mut self) {
        let now = Instant::now();
        self.created_at = now;
        self.last_used_at = now;
    }
}

/// One slot of the keyed entry table.
///
/// The per-slot mutex is the per-key lock: every status transition and every
/// scale-in/refresh decision happens under it, never while a table shard
/// guard is held.
pub(crate) struct Slot<T> {
    pub(crate) key: u64,
    pub(crate) state: Mutex<SlotState<T>>,
}

impl<T> Slot<T> {
    /// A freshly constructed slot; the publisher transitions it to
    /// `Available` (prewarm, scale-out) or `Acquired` (miss path) before it
    /// becomes reachable.
    pub(crate) fn new(key: u64, object: Option<T>) -> Self {
        let now = Instant::now();
        Slot {
            key,
            state: Mutex::new(SlotState {
                status: EntryStatus::Initialized,
                object,
                created_at: now,
                last_used_at: now,
            }),
        }
    }
}

/// A checked-out pool entry.
///
/// Holds the payload for the duration of the checkout. Entries are returned
/// with [`ObjectPool::release`](crate::ObjectPool::release) (or the
/// auto-scaling equivalent); they cannot be cloned, so a double release is
/// unrepresentable.
pub struct Entry<T> {
    pool_id: u64,
    key: u64,
    object: Option<T>,
}

impl<T> Entry<T> {
    pub(crate) fn new(pool_id: u64, key: u64, object: T) -> Self {
        Entry {
            pool_id,
            key,
            object: Some(object),
        }
    }

    /// The pooled payload.
    pub fn object(&self) -> &T {
        self.object.as_ref().expect("entry payload already taken")
    }

    /// Mutable access to the pooled payload.
    pub fn object_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("entry payload already taken")
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn take_object(&mut self) -> T {
        self.object.take().expect("entry payload already taken")
    }
}

impl<T> Drop for Entry<T> {
    fn drop(&mut self) {
        if self.object.is_some() {
            // The slot stays acquired forever; make the leak visible.
            tracing::warn!(key = self.key, "pool entry dropped without release");
        }
    }
}
