//! Metrics collection for the pools

use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time metrics for a pool.
///
/// # Examples
///
/// ```
/// use scalepool::{ObjectPool, PoolConfig};
///
/// let config = PoolConfig::new(|| Ok(0u32)).with_min_size(2).with_max_size(4);
/// let pool = ObjectPool::new(config).unwrap();
///
/// let entry = pool.acquire().unwrap();
/// let metrics = pool.metrics();
/// assert_eq!(metrics.total_acquired, 1);
/// assert_eq!(metrics.acquired_count, 1);
/// assert_eq!(metrics.available_count, 1);
/// pool.release(entry).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Entries manufactured by the factory over the pool's lifetime.
    pub total_created: usize,

    /// Successful acquires over the pool's lifetime.
    pub total_acquired: usize,

    /// Releases that returned an entry to the available queue.
    pub total_released: usize,

    /// Entries whose payload was replaced in place (TTL or staleness).
    pub total_refreshed: usize,

    /// Entries removed by idle scale-in or by a failed refresh.
    pub total_scaled_in: usize,

    /// Factory invocations that returned an error.
    pub factory_failures: usize,

    /// Entries currently checked out (including those owing a refresh).
    pub acquired_count: usize,

    /// Entries currently resident and claimable.
    pub available_count: usize,

    /// Current number of resident entries.
    pub size: usize,

    /// Hard cap on resident entries.
    pub max_size: usize,
}

/// Internal lifetime counters.
#[derive(Default)]
pub(crate) struct MetricsTracker {
    total_created: AtomicUsize,
    total_acquired: AtomicUsize,
    total_released: AtomicUsize,
    total_refreshed: AtomicUsize,
    total_scaled_in: AtomicUsize,
    factory_failures: AtomicUsize,
}

impl MetricsTracker {
    pub(crate) fn record_created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquired(&self) {
        self.total_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.total_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refreshed(&self) {
        self.total_refreshed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scaled_in(&self) {
        self.total_scaled_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_factory_failure(&self) {
        self.factory_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        acquired: usize,
        available: usize,
        size: usize,
        max_size: usize,
    ) -> PoolMetrics {
        PoolMetrics {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_refreshed: self.total_refreshed.load(Ordering::Relaxed),
            total_scaled_in: self.total_scaled_in.load(Ordering::Relaxed),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
            acquired_count: acquired,
            available_count: available,
            size,
            max_size,
        }
    }
}
