//! Bounded object pool engine

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::entry::{Entry, EntryStatus, Slot};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::{MetricsTracker, PoolMetrics};
use crate::sync::Semaphore;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// A bounded object pool.
///
/// Lazily manufactures up to `max_size` payloads through the configured
/// factory and hands them out as [`Entry`] values. Acquirers block while the
/// pool is saturated; [`try_acquire`](ObjectPool::try_acquire) fails fast
/// instead. Cloning the pool yields another handle to the same state.
///
/// # Examples
///
/// ```
/// use scalepool::{ObjectPool, PoolConfig};
///
/// let config = PoolConfig::new(|| Ok(String::from("conn"))).with_max_size(2);
/// let pool = ObjectPool::new(config).unwrap();
///
/// let entry = pool.acquire().unwrap();
/// assert_eq!(entry.object(), "conn");
/// pool.release(entry).unwrap();
/// ```
pub struct ObjectPool<T> {
    pub(crate) inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct PoolInner<T> {
    pub(crate) id: u64,
    pub(crate) config: PoolConfig<T>,
    pub(crate) entries: DashMap<u64, Arc<Slot<T>>>,
    pub(crate) available: SegQueue<Arc<Slot<T>>>,
    pub(crate) permits: Semaphore,
    pub(crate) closed: AtomicBool,
    pub(crate) metrics: MetricsTracker,
    // Serializes the "size < max_size => insert" check against other inserts.
    add_lock: Mutex<()>,
    next_key: AtomicU64,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Creates the pool and prewarms `min_size` entries.
    ///
    /// Fails with the factory's error if prewarming does; entries already
    /// manufactured are handed to the close hook.
    pub fn new(config: PoolConfig<T>) -> PoolResult<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            permits: Semaphore::new(config.max_size),
            entries: DashMap::new(),
            available: SegQueue::new(),
            closed: AtomicBool::new(false),
            metrics: MetricsTracker::default(),
            add_lock: Mutex::new(()),
            next_key: AtomicU64::new(0),
            config,
        });

        for _ in 0..inner.config.min_size {
            if let Err(err) = inner.insert_available() {
                inner.close_pool();
                return Err(err);
            }
        }

        Ok(ObjectPool { inner })
    }

    /// Checks out an entry, blocking while the pool is saturated.
    ///
    /// Returns [`PoolError::PoolClosed`] once the pool closes, including for
    /// callers already blocked at that moment.
    pub fn acquire(&self) -> PoolResult<Entry<T>> {
        self.inner.permits.acquire()?;
        match self.inner.claim() {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.inner.permits.release();
                Err(err)
            }
        }
    }

    /// Non-blocking checkout; `Ok(None)` when the pool is saturated.
    pub fn try_acquire(&self) -> PoolResult<Option<Entry<T>>> {
        if !self.inner.permits.try_acquire()? {
            return Ok(None);
        }
        match self.inner.claim() {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                self.inner.permits.release();
                Err(err)
            }
        }
    }

    /// Returns a checked-out entry to the pool.
    ///
    /// Releasing an entry of another pool is reported as
    /// [`PoolError::ForeignEntry`]. After close, the release still succeeds:
    /// the payload goes to the close hook and the entry stays terminal.
    pub fn release(&self, entry: Entry<T>) -> PoolResult<()> {
        self.inner.release_entry(entry)
    }

    /// Number of resident entries.
    pub fn size(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics_snapshot()
    }

    /// Closes the pool: pending acquirers fail, every resident payload is
    /// handed to the close hook exactly once. Idempotent.
    pub fn close(&self) {
        self.inner.close_pool();
    }
}

impl<T: Send + 'static> PoolInner<T> {
    fn alloc_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, key: u64) -> Option<Arc<Slot<T>>> {
        // Clone the Arc out so no table shard guard is held while the
        // per-entry lock is taken.
        self.entries.get(&key).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn new_object(&self) -> PoolResult<T> {
        (self.config.factory)().map_err(|err| {
            self.metrics.record_factory_failure();
            PoolError::FactoryFailed(err)
        })
    }

    /// Manufactures one `Available` entry; `Ok(false)` when at capacity.
    pub(crate) fn insert_available(&self) -> PoolResult<bool> {
        let _guard = self.add_lock.lock();
        if self.entries.len() >= self.config.max_size {
            return Ok(false);
        }
        let object = self.new_object()?;
        let slot = Arc::new(Slot::new(self.alloc_key(), Some(object)));
        slot.state.lock().status = EntryStatus::Available;
        self.entries.insert(slot.key, Arc::clone(&slot));
        self.available.push(slot);
        self.metrics.record_created();
        Ok(true)
    }

    /// Claims an entry under a permit already held by the caller.
    pub(crate) fn claim(&self) -> PoolResult<Entry<T>> {
        loop {
            if let Some(entry) = self.pop_available() {
                return Ok(entry);
            }
            match self.try_create_acquired()? {
                Some(entry) => return Ok(entry),
                // The table is momentarily full while a release is between
                // its queue push and its permit return; retry the pop.
                None => thread::yield_now(),
            }
        }
    }

    /// Pops the next genuinely available entry, skipping queue residue left
    /// behind by scale-in and close.
    pub(crate) fn pop_available(&self) -> Option<Entry<T>> {
        while let Some(slot) = self.available.pop() {
            let mut state = slot.state.lock();
            if state.status == EntryStatus::Available {
                if let Some(object) = state.object.take() {
                    state.status = EntryStatus::Acquired;
                    state.touch();
                    drop(state);
                    self.metrics.record_acquired();
                    return Some(Entry::new(self.id, slot.key, object));
                }
            }
        }
        None
    }

    /// Miss path: manufactures an entry that is born `Acquired`.
    pub(crate) fn try_create_acquired(&self) -> PoolResult<Option<Entry<T>>> {
        let _guard = self.add_lock.lock();
        if self.entries.len() >= self.config.max_size {
            return Ok(None);
        }
        let object = self.new_object()?;
        let key = self.alloc_key();
        let slot = Arc::new(Slot::new(key, None));
        slot.state.lock().status = EntryStatus::Acquired;
        self.entries.insert(key, slot);
        self.metrics.record_created();
        self.metrics.record_acquired();
        Ok(Some(Entry::new(self.id, key, object)))
    }

    pub(crate) fn release_entry(&self, mut entry: Entry<T>) -> PoolResult<()> {
        if entry.pool_id() != self.id {
            return Err(PoolError::ForeignEntry);
        }
        let key = entry.key();
        let object = entry.take_object();

        if self.closed.load(Ordering::Acquire) {
            self.close_object(object);
            return Ok(());
        }
        let Some(slot) = self.slot(key) else {
            return Err(PoolError::InvalidRelease);
        };

        let mut state = slot.state.lock();
        match state.status {
            EntryStatus::Acquired => {
                state.object = Some(object);
                state.status = EntryStatus::Available;
                state.touch();
                drop(state);
                self.available.push(slot);
                self.permits.release();
                self.metrics.record_released();
                Ok(())
            }
            // Closed between the flag check above and the slot lock.
            EntryStatus::Closed => {
                drop(state);
                self.close_object(object);
                Ok(())
            }
            _ => Err(PoolError::InvalidRelease),
        }
    }

    pub(crate) fn close_pool(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let keys: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained = 0usize;
        for key in keys {
            let Some((_, slot)) = self.entries.remove(&key) else {
                continue;
            };
            let object = {
                let mut state = slot.state.lock();
                state.status = EntryStatus::Closed;
                state.object.take()
            };
            // Acquired entries have no resident payload; their holders run
            // the hook on release.
            if let Some(object) = object {
                self.close_object(object);
                drained += 1;
            }
        }
        tracing::debug!(pool = self.id, drained, "pool closed");
    }

    /// Runs the close hook; a panicking hook is logged and swallowed.
    pub(crate) fn close_object(&self, object: T) {
        if let Some(hook) = &self.config.on_close {
            let hook = Arc::clone(hook);
            if catch_unwind(AssertUnwindSafe(move || hook(object))).is_err() {
                tracing::error!(pool = self.id, "close hook panicked");
            }
        }
    }

    pub(crate) fn metrics_snapshot(&self) -> PoolMetrics {
        let slots: Vec<Arc<Slot<T>>> = self
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let size = slots.len();
        let mut available = 0;
        let mut acquired = 0;
        for slot in slots {
            match slot.state.lock().status {
                EntryStatus::Available => available += 1,
                EntryStatus::Acquired | EntryStatus::PendingRefresh => acquired += 1,
                _ => {}
            }
        }
        self.metrics
            .snapshot(acquired, available, size, self.config.max_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_config() -> PoolConfig<usize> {
        let counter = AtomicUsize::new(0);
        PoolConfig::new(move || Ok(counter.fetch_add(1, Ordering::Relaxed)))
    }

    #[test]
    fn prewarm_creates_min_entries() {
        let pool = ObjectPool::new(counter_config().with_min_size(2).with_max_size(5)).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.metrics().available_count, 2);
        assert_eq!(pool.metrics().total_created, 2);
    }

    #[test]
    fn payloads_are_manufactured_in_order() {
        let pool = ObjectPool::new(counter_config().with_min_size(1).with_max_size(3)).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!((*a.object(), *b.object(), *c.object()), (0, 1, 2));

        assert!(pool.try_acquire().unwrap().is_none());

        pool.release(b).unwrap();
        let again = pool.acquire().unwrap();
        assert_eq!(*again.object(), 1);

        pool.release(a).unwrap();
        pool.release(c).unwrap();
        pool.release(again).unwrap();
    }

    #[test]
    fn release_round_trip_restores_the_pool() {
        let pool = ObjectPool::new(counter_config().with_min_size(2).with_max_size(3)).unwrap();

        let entry = pool.acquire().unwrap();
        pool.release(entry).unwrap();

        assert_eq!(pool.size(), 2);
        let metrics = pool.metrics();
        assert_eq!(metrics.available_count, 2);
        assert_eq!(metrics.acquired_count, 0);
        assert_eq!(pool.inner.permits.available(), 3);
    }

    #[test]
    fn permit_accounting_matches_acquired_count() {
        let pool = ObjectPool::new(counter_config().with_max_size(3)).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.inner.permits.available(), 1);
        assert_eq!(pool.metrics().acquired_count, 2);

        pool.release(a).unwrap();
        assert_eq!(pool.inner.permits.available(), 2);
        pool.release(b).unwrap();
        assert_eq!(pool.inner.permits.available(), 3);
    }

    #[test]
    fn factory_failure_returns_the_permit() {
        let fail = Arc::new(AtomicBool::new(true));
        let counter = AtomicUsize::new(0);
        let config = {
            let fail = Arc::clone(&fail);
            PoolConfig::new(move || {
                if fail.load(Ordering::Relaxed) {
                    Err("factory down".into())
                } else {
                    Ok(counter.fetch_add(1, Ordering::Relaxed))
                }
            })
            .with_max_size(1)
        };
        let pool = ObjectPool::new(config).unwrap();

        assert!(matches!(pool.acquire(), Err(PoolError::FactoryFailed(_))));
        assert_eq!(pool.metrics().factory_failures, 1);

        // The reserved permit came back, so the next acquire may create.
        fail.store(false, Ordering::Relaxed);
        let entry = pool.acquire().unwrap();
        assert_eq!(*entry.object(), 0);
        pool.release(entry).unwrap();
    }

    #[test]
    fn foreign_entries_are_rejected() {
        let pool_a = ObjectPool::new(counter_config().with_max_size(1)).unwrap();
        let pool_b = ObjectPool::new(counter_config().with_max_size(1)).unwrap();

        let entry = pool_a.acquire().unwrap();
        assert!(matches!(
            pool_b.release(entry),
            Err(PoolError::ForeignEntry)
        ));
    }

    #[test]
    fn close_drains_and_invokes_hook_once_per_payload() {
        let closed = Arc::new(AtomicUsize::new(0));
        let config = {
            let closed = Arc::clone(&closed);
            counter_config()
                .with_min_size(2)
                .with_max_size(4)
                .with_on_close(move |_| {
                    closed.fetch_add(1, Ordering::Relaxed);
                })
        };
        let pool = ObjectPool::new(config).unwrap();

        let held = pool.acquire().unwrap();
        pool.close();
        assert_eq!(pool.size(), 0);
        assert!(pool.is_closed());
        // Both prewarmed payloads were drained; the held one was not.
        assert_eq!(closed.load(Ordering::Relaxed), 1);

        // Release after close still runs the hook, once.
        pool.release(held).unwrap();
        assert_eq!(closed.load(Ordering::Relaxed), 2);

        assert!(matches!(pool.acquire(), Err(PoolError::PoolClosed)));
        assert!(matches!(pool.try_acquire(), Err(PoolError::PoolClosed)));
        pool.close();
        assert_eq!(closed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn blocked_acquirer_receives_released_entry() {
        let pool = ObjectPool::new(counter_config().with_max_size(1)).unwrap();
        let entry = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|e| *e.object()))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        pool.release(entry).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn close_unblocks_pending_acquirers() {
        let pool = ObjectPool::new(counter_config().with_max_size(1)).unwrap();
        let _held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };

        thread::sleep(Duration::from_millis(50));
        pool.close();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(PoolError::PoolClosed)
        ));
    }

    #[test]
    fn concurrent_churn_never_exceeds_max_size() {
        let pool = ObjectPool::new(counter_config().with_max_size(4)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let entry = pool.acquire().unwrap();
                        assert!(pool.size() <= 4);
                        pool.release(entry).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(pool.size() <= 4);
        assert!(pool.metrics().total_created <= 4);
    }
}
