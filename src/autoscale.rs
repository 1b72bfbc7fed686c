//! Auto-scaling extension over the bounded pool engine

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};

use crate::config::{AutoScaleConfig, StaleChecker};
use crate::entry::{Entry, EntryStatus, Slot};
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::pool::{ObjectPool, PoolInner};

/// An auto-scaling object pool.
///
/// Behaves like [`ObjectPool`] and additionally: grows in `scale_factor`-sized
/// batches when an acquire misses, periodically scales idle entries in down to
/// `min_size`, and replaces payloads that exceed `object_ttl` or that the
/// stale checker rejects. At most one scale-out batch is in flight at a time.
///
/// # Examples
///
/// ```
/// use scalepool::{AutoScaleConfig, AutoScaleObjectPool, PoolConfig};
///
/// let config = AutoScaleConfig::new(
///     PoolConfig::new(|| Ok(String::from("conn"))).with_max_size(8),
/// );
/// let pool = AutoScaleObjectPool::new(config).unwrap();
///
/// let entry = pool.acquire().unwrap();
/// assert_eq!(entry.object(), "conn");
/// pool.release(entry).unwrap();
/// pool.close();
/// ```
pub struct AutoScaleObjectPool<T> {
    pub(crate) pool: ObjectPool<T>,
    pub(crate) shared: Arc<AutoScaleShared<T>>,
}

impl<T> Clone for AutoScaleObjectPool<T> {
    fn clone(&self) -> Self {
        AutoScaleObjectPool {
            pool: self.pool.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct AutoScaleShared<T> {
    check_interval: Duration,
    object_ttl: Duration,
    max_idle_time: Duration,
    scale_factor: usize,
    stale_checker: Option<StaleChecker<T>>,
    scaling_out: Arc<AtomicBool>,
    stop: Mutex<bool>,
    stop_signal: Condvar,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    batch: Mutex<Option<JoinHandle<()>>>,
    refresh_tx: Mutex<Option<Sender<RefreshJob<T>>>>,
    refresh_worker: Mutex<Option<JoinHandle<()>>>,
}

/// A released entry whose refresh was handed off the caller's thread.
struct RefreshJob<T> {
    slot: Arc<Slot<T>>,
    object: T,
}

impl<T: Send + 'static> AutoScaleObjectPool<T> {
    /// Creates the pool, prewarms `min_size` entries, and starts the
    /// background sweep.
    pub fn new(config: AutoScaleConfig<T>) -> PoolResult<Self> {
        config.validate()?;
        let AutoScaleConfig {
            pool,
            check_interval,
            object_ttl,
            max_idle_time,
            scale_factor,
            stale_checker,
        } = config;

        let pool = ObjectPool::new(pool)?;
        let (refresh_tx, refresh_rx) = bounded(1);
        let shared = Arc::new(AutoScaleShared {
            check_interval,
            object_ttl,
            max_idle_time,
            scale_factor,
            stale_checker,
            scaling_out: Arc::new(AtomicBool::new(false)),
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
            sweeper: Mutex::new(None),
            batch: Mutex::new(None),
            refresh_tx: Mutex::new(Some(refresh_tx)),
            refresh_worker: Mutex::new(None),
        });

        *shared.sweeper.lock() = Some(spawn_sweeper(
            Arc::downgrade(&pool.inner),
            Arc::downgrade(&shared),
        ));
        *shared.refresh_worker.lock() = Some(spawn_refresh_worker(
            Arc::downgrade(&pool.inner),
            Arc::downgrade(&shared),
            refresh_rx,
        ));

        Ok(AutoScaleObjectPool { pool, shared })
    }

    /// Checks out an entry, blocking while the pool is saturated.
    ///
    /// A miss manufactures one entry for the caller immediately and, when
    /// `scale_factor > 1`, schedules a background batch for the rest.
    pub fn acquire(&self) -> PoolResult<Entry<T>> {
        self.pool.inner.permits.acquire()?;
        match self.claim() {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.pool.inner.permits.release();
                Err(err)
            }
        }
    }

    /// Non-blocking checkout; `Ok(None)` when the pool is saturated.
    pub fn try_acquire(&self) -> PoolResult<Option<Entry<T>>> {
        if !self.pool.inner.permits.try_acquire()? {
            return Ok(None);
        }
        match self.claim() {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                self.pool.inner.permits.release();
                Err(err)
            }
        }
    }

    fn claim(&self) -> PoolResult<Entry<T>> {
        let inner = &self.pool.inner;
        loop {
            if let Some(entry) = inner.pop_available() {
                return Ok(entry);
            }
            match inner.try_create_acquired()? {
                Some(entry) => {
                    self.schedule_scale_out();
                    return Ok(entry);
                }
                None => thread::yield_now(),
            }
        }
    }

    /// Returns a checked-out entry.
    ///
    /// An entry flagged for refresh is replaced before it goes back into the
    /// available queue; the replacement is built off the caller's thread when
    /// the internal refresh slot is free, inline otherwise.
    pub fn release(&self, mut entry: Entry<T>) -> PoolResult<()> {
        let inner = &self.pool.inner;
        if entry.pool_id() != inner.id {
            return Err(PoolError::ForeignEntry);
        }
        let key = entry.key();
        let object = entry.take_object();

        if inner.closed.load(Ordering::Acquire) {
            inner.close_object(object);
            return Ok(());
        }
        let Some(slot) = inner.slot(key) else {
            return Err(PoolError::InvalidRelease);
        };

        let mut state = slot.state.lock();
        match state.status {
            EntryStatus::Acquired => {
                state.object = Some(object);
                state.status = EntryStatus::Available;
                state.touch();
                drop(state);
                inner.available.push(slot);
                inner.permits.release();
                inner.metrics.record_released();
                Ok(())
            }
            EntryStatus::PendingRefresh => {
                drop(state);
                self.refresh_on_release(slot, object);
                Ok(())
            }
            EntryStatus::Closed => {
                drop(state);
                inner.close_object(object);
                Ok(())
            }
            _ => Err(PoolError::InvalidRelease),
        }
    }

    /// Number of resident entries.
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Stops the sweep, waits for background work, and closes the pool.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut stopped = self.shared.stop.lock();
            *stopped = true;
        }
        self.shared.stop_signal.notify_all();
        if let Some(handle) = self.shared.sweeper.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.shared.batch.lock().take() {
            let _ = handle.join();
        }
        // Dropping the sender drains the refresh worker and lets it exit.
        drop(self.shared.refresh_tx.lock().take());
        if let Some(handle) = self.shared.refresh_worker.lock().take() {
            let _ = handle.join();
        }
        self.pool.close();
    }

    /// Schedules the `scale_factor - 1` remainder of a miss batch, unless a
    /// batch is already in flight.
    fn schedule_scale_out(&self) {
        let extra = self.shared.scale_factor.saturating_sub(1);
        if extra == 0 {
            return;
        }
        if self
            .shared
            .scaling_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.pool.inner);
        let flag = Arc::clone(&self.shared.scaling_out);
        let handle = thread::Builder::new()
            .name("scalepool-scale-out".into())
            .spawn(move || {
                let _reset = ResetOnDrop(flag);
                for _ in 0..extra {
                    if inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    match inner.insert_available() {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(err) => {
                            tracing::warn!(
                                pool = inner.id,
                                error = %err,
                                "scale-out batch stopped early"
                            );
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn scale-out thread");

        let mut batch = self.shared.batch.lock();
        if let Some(previous) = batch.take() {
            // The flag was clear when we won the CAS, so this join is
            // effectively immediate.
            let _ = previous.join();
        }
        *batch = Some(handle);
    }

    fn refresh_on_release(&self, slot: Arc<Slot<T>>, object: T) {
        let mut job = RefreshJob { slot, object };
        {
            let sender = self.shared.refresh_tx.lock();
            if let Some(tx) = sender.as_ref() {
                match tx.try_send(job) {
                    Ok(()) => return,
                    Err(TrySendError::Full(returned)) | Err(TrySendError::Disconnected(returned)) => {
                        job = returned;
                    }
                }
            } else {
                return refresh_released_entry(
                    &self.pool.inner,
                    &self.shared,
                    job.slot,
                    job.object,
                );
            }
        }
        // Handoff saturated or unavailable; do the work inline.
        refresh_released_entry(&self.pool.inner, &self.shared, job.slot, job.object);
    }
}

/// Clears the single-flight scale-out flag however the batch ends.
struct ResetOnDrop(Arc<AtomicBool>);

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> AutoScaleShared<T> {
    /// Runs the user predicate; a panic is logged and counts as fresh.
    fn is_stale(&self, object: &T) -> bool {
        let Some(checker) = &self.stale_checker else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| checker(object))) {
            Ok(stale) => stale,
            Err(_) => {
                tracing::warn!("stale checker panicked; treating object as fresh");
                false
            }
        }
    }
}

fn spawn_sweeper<T: Send + 'static>(
    inner: Weak<PoolInner<T>>,
    shared: Weak<AutoScaleShared<T>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("scalepool-sweeper".into())
        .spawn(move || {
            loop {
                let Some(shared) = shared.upgrade() else { break };
                {
                    let mut stopped = shared.stop.lock();
                    if !*stopped {
                        let _ = shared
                            .stop_signal
                            .wait_for(&mut stopped, shared.check_interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                let Some(inner) = inner.upgrade() else { break };
                sweep(&inner, &shared);
            }
        })
        .expect("failed to spawn sweeper thread")
}

/// One pass over a snapshot of the table: idle scale-in first, then TTL and
/// staleness refresh.
fn sweep<T: Send + 'static>(inner: &Arc<PoolInner<T>>, shared: &AutoScaleShared<T>) {
    let keys: Vec<u64> = inner.entries.iter().map(|e| *e.key()).collect();
    for key in keys {
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(slot) = inner.slot(key) else { continue };

        let mut state = slot.state.lock();
        match state.status {
            EntryStatus::Available => {
                if state.last_used_at.elapsed() >= shared.max_idle_time
                    && inner.entries.len() > inner.config.min_size
                {
                    state.status = EntryStatus::Closed;
                    let object = state.object.take();
                    drop(state);
                    inner.entries.remove(&key);
                    inner.metrics.record_scaled_in();
                    if let Some(object) = object {
                        inner.close_object(object);
                    }
                    tracing::debug!(pool = inner.id, key, "scaled in idle entry");
                    continue;
                }
                let expired = state.created_at.elapsed() >= shared.object_ttl;
                let stale =
                    !expired && state.object.as_ref().is_some_and(|o| shared.is_stale(o));
                if expired || stale {
                    drop(state);
                    refresh_in_place(inner, &slot);
                }
            }
            EntryStatus::Acquired => {
                // The holder performs the refresh on release.
                if state.created_at.elapsed() >= shared.object_ttl {
                    state.status = EntryStatus::PendingRefresh;
                }
            }
            _ => {}
        }
    }
}

/// Swaps a fresh payload into an available entry under its key.
fn refresh_in_place<T: Send + 'static>(inner: &Arc<PoolInner<T>>, slot: &Arc<Slot<T>>) {
    let replacement = match inner.new_object() {
        Ok(object) => object,
        Err(err) => {
            tracing::warn!(
                pool = inner.id,
                key = slot.key,
                error = %err,
                "refresh failed; keeping existing object"
            );
            return;
        }
    };
    let mut state = slot.state.lock();
    if state.status == EntryStatus::Available {
        let old = state.object.replace(replacement);
        state.renew();
        drop(state);
        inner.metrics.record_refreshed();
        tracing::debug!(pool = inner.id, key = slot.key, "refreshed entry");
        if let Some(old) = old {
            inner.close_object(old);
        }
    } else {
        // Claimed or closed while the replacement was being built.
        drop(state);
        inner.close_object(replacement);
    }
}

fn spawn_refresh_worker<T: Send + 'static>(
    inner: Weak<PoolInner<T>>,
    shared: Weak<AutoScaleShared<T>>,
    jobs: Receiver<RefreshJob<T>>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("scalepool-refresh".into())
        .spawn(move || {
            while let Ok(job) = jobs.recv() {
                let (Some(inner), Some(shared)) = (inner.upgrade(), shared.upgrade()) else {
                    break;
                };
                refresh_released_entry(&inner, &shared, job.slot, job.object);
            }
        })
        .expect("failed to spawn refresh thread")
}

/// Completes the release of an entry that owes a refresh: replace the payload
/// on success, otherwise scale the entry in if it must not serve again.
fn refresh_released_entry<T: Send + 'static>(
    inner: &Arc<PoolInner<T>>,
    shared: &AutoScaleShared<T>,
    slot: Arc<Slot<T>>,
    object: T,
) {
    match inner.new_object() {
        Ok(replacement) => {
            let mut state = slot.state.lock();
            if state.status == EntryStatus::PendingRefresh {
                state.object = Some(replacement);
                state.status = EntryStatus::Available;
                state.renew();
                drop(state);
                inner.available.push(slot);
                inner.permits.release();
                inner.metrics.record_refreshed();
                inner.metrics.record_released();
                inner.close_object(object);
            } else {
                // Pool closed while the refresh was pending.
                drop(state);
                inner.close_object(object);
                inner.close_object(replacement);
            }
        }
        Err(err) => {
            tracing::warn!(
                pool = inner.id,
                key = slot.key,
                error = %err,
                "refresh on release failed"
            );
            let expired = slot.state.lock().created_at.elapsed() >= shared.object_ttl;
            if expired || shared.is_stale(&object) {
                let mut state = slot.state.lock();
                if state.status == EntryStatus::PendingRefresh {
                    state.status = EntryStatus::Closed;
                    drop(state);
                    inner.entries.remove(&slot.key);
                    inner.permits.release();
                    inner.metrics.record_scaled_in();
                    tracing::debug!(
                        pool = inner.id,
                        key = slot.key,
                        "scaled in entry after failed refresh"
                    );
                } else {
                    drop(state);
                }
                inner.close_object(object);
            } else {
                // No longer stale; keep serving the old payload.
                let mut state = slot.state.lock();
                if state.status == EntryStatus::PendingRefresh {
                    state.object = Some(object);
                    state.status = EntryStatus::Available;
                    state.touch();
                    drop(state);
                    inner.available.push(slot);
                    inner.permits.release();
                    inner.metrics.record_released();
                } else {
                    drop(state);
                    inner.close_object(object);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counter_config() -> PoolConfig<usize> {
        let counter = AtomicUsize::new(0);
        PoolConfig::new(move || Ok(counter.fetch_add(1, Ordering::Relaxed)))
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    const LONG: Duration = Duration::from_secs(3600);

    #[test]
    fn miss_triggers_background_scale_out() {
        let config = AutoScaleConfig::new(counter_config().with_max_size(10))
            .with_scale_factor(5)
            .with_check_interval(LONG)
            .with_object_ttl(LONG)
            .with_max_idle_time(LONG);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        let entry = pool.acquire().unwrap();
        assert_eq!(*entry.object(), 0);

        assert!(wait_until(Duration::from_secs(2), || pool.size() == 5));
        pool.release(entry).unwrap();
        pool.close();
    }

    #[test]
    fn only_one_batch_is_in_flight() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factory_counter = Arc::clone(&counter);
        let config = AutoScaleConfig::new(
            PoolConfig::new(move || {
                thread::sleep(Duration::from_millis(30));
                Ok(factory_counter.fetch_add(1, Ordering::Relaxed))
            })
            .with_max_size(20),
        )
        .with_scale_factor(10)
        .with_check_interval(LONG)
        .with_object_ttl(LONG)
        .with_max_idle_time(LONG);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        // Two rapid misses while the first batch is still running must not
        // schedule a second batch.
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();

        thread::sleep(Duration::from_millis(800));
        assert!(pool.size() <= 11, "size {} implies a second batch", pool.size());
        assert!(pool.size() >= 10);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        pool.close();
    }

    #[test]
    fn idle_entries_scale_in_to_min_size() {
        let config = AutoScaleConfig::new(
            counter_config().with_min_size(1).with_max_size(10),
        )
        .with_check_interval(Duration::from_millis(50))
        .with_object_ttl(LONG)
        .with_max_idle_time(Duration::from_millis(100));
        let pool = AutoScaleObjectPool::new(config).unwrap();

        let entries: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.size(), 5);
        for entry in entries {
            pool.release(entry).unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || pool.size() == 1));
        assert!(pool.metrics().total_scaled_in >= 4);
        pool.close();
    }

    #[test]
    fn expired_entries_are_refreshed_in_place() {
        let config = AutoScaleConfig::new(
            counter_config().with_min_size(1).with_max_size(3),
        )
        .with_check_interval(Duration::from_millis(50))
        .with_object_ttl(Duration::from_millis(100))
        .with_max_idle_time(LONG);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            pool.metrics().total_refreshed >= 1
        }));
        assert_eq!(pool.size(), 1);

        let entry = pool.acquire().unwrap();
        assert!(*entry.object() > 0, "payload was not replaced");
        pool.release(entry).unwrap();
        pool.close();
    }

    #[test]
    fn stale_entries_are_refreshed_others_persist() {
        let config = AutoScaleConfig::new(
            counter_config().with_min_size(2).with_max_size(4),
        )
        .with_check_interval(Duration::from_millis(30))
        .with_object_ttl(LONG)
        .with_max_idle_time(LONG)
        .with_stale_checker(|value: &usize| *value == 0);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            pool.metrics().total_refreshed >= 1
        }));

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(*a.object(), 0);
        assert_ne!(*b.object(), 0);
        // The non-stale prewarmed payload is still serving.
        assert!(*a.object() == 1 || *b.object() == 1);

        pool.release(a).unwrap();
        pool.release(b).unwrap();
        pool.close();
    }

    #[test]
    fn held_entries_are_flagged_and_refreshed_on_release() {
        let config = AutoScaleConfig::new(
            counter_config().with_min_size(1).with_max_size(2),
        )
        .with_check_interval(Duration::from_millis(30))
        .with_object_ttl(Duration::from_millis(100))
        .with_max_idle_time(LONG);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        let entry = pool.acquire().unwrap();
        assert_eq!(*entry.object(), 0);

        // Let the sweep flag the held entry.
        thread::sleep(Duration::from_millis(250));
        pool.release(entry).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            pool.metrics().total_refreshed >= 1
        }));
        assert_eq!(pool.size(), 1);

        let entry = pool.acquire().unwrap();
        assert!(*entry.object() > 0);
        pool.release(entry).unwrap();
        pool.close();
    }

    #[test]
    fn failed_refresh_of_expired_entry_scales_it_in() {
        let closed = Arc::new(AtomicUsize::new(0));
        let close_count = Arc::clone(&closed);
        let calls = AtomicUsize::new(0);
        let config = AutoScaleConfig::new(
            PoolConfig::new(move || {
                if calls.fetch_add(1, Ordering::Relaxed) == 0 {
                    Ok(0usize)
                } else {
                    Err("factory down".into())
                }
            })
            .with_max_size(2)
            .with_on_close(move |_| {
                close_count.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .with_check_interval(Duration::from_millis(30))
        .with_object_ttl(Duration::from_millis(80))
        .with_max_idle_time(LONG);
        let pool = AutoScaleObjectPool::new(config).unwrap();

        let entry = pool.acquire().unwrap();
        thread::sleep(Duration::from_millis(200));
        pool.release(entry).unwrap();

        assert!(wait_until(Duration::from_secs(2), || pool.size() == 0));
        assert!(wait_until(Duration::from_secs(1), || {
            closed.load(Ordering::Relaxed) == 1
        }));
        assert!(pool.metrics().total_scaled_in >= 1);
        pool.close();
    }

    #[test]
    fn close_stops_background_work() {
        let config = AutoScaleConfig::new(counter_config().with_min_size(1).with_max_size(4))
            .with_check_interval(Duration::from_millis(20))
            .with_object_ttl(Duration::from_millis(50))
            .with_max_idle_time(Duration::from_millis(50));
        let pool = AutoScaleObjectPool::new(config).unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.size(), 0);
        assert!(matches!(pool.acquire(), Err(PoolError::PoolClosed)));
        pool.close();
    }
}
