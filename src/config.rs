//! Pool configuration options

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{BoxError, PoolError, PoolResult};

pub(crate) const DEFAULT_MAX_SIZE: usize = 16;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_OBJECT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);
const DEFAULT_QUEUE_CAPACITY: usize = 64;

pub(crate) type Factory<T> = Arc<dyn Fn() -> Result<T, BoxError> + Send + Sync>;
pub(crate) type CloseHook<T> = Arc<dyn Fn(T) + Send + Sync>;
pub(crate) type StaleChecker<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Configuration for a bounded object pool.
///
/// # Examples
///
/// ```
/// use scalepool::PoolConfig;
///
/// let config = PoolConfig::new(|| Ok(Vec::<u8>::with_capacity(4096)))
///     .with_min_size(2)
///     .with_max_size(8);
///
/// assert_eq!(config.min_size, 2);
/// assert_eq!(config.max_size, 8);
/// ```
pub struct PoolConfig<T> {
    /// Number of entries manufactured eagerly at construction.
    pub min_size: usize,

    /// Hard cap on resident entries.
    pub max_size: usize,

    pub(crate) factory: Factory<T>,
    pub(crate) on_close: Option<CloseHook<T>>,
}

impl<T> PoolConfig<T> {
    /// Creates a configuration around the object factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    {
        PoolConfig {
            min_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            factory: Arc::new(factory),
            on_close: None,
        }
    }

    /// Set the prewarm count (also the scale-in floor under auto-scaling).
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the hard cap on resident entries.
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Hook invoked once per payload when its entry leaves the pool.
    pub fn with_on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig("min_size cannot exceed max_size"));
        }
        Ok(())
    }
}

impl<T> Clone for PoolConfig<T> {
    fn clone(&self) -> Self {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            factory: Arc::clone(&self.factory),
            on_close: self.on_close.clone(),
        }
    }
}

impl<T> fmt::Debug for PoolConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("has_on_close", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for an auto-scaling object pool.
///
/// Extends a [`PoolConfig`] with the sweep period, payload lifetime bounds,
/// the scale-out batch size, and an optional staleness predicate.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use scalepool::{AutoScaleConfig, PoolConfig};
///
/// let config = AutoScaleConfig::new(PoolConfig::new(|| Ok(0i64)).with_max_size(32))
///     .with_check_interval(Duration::from_secs(5))
///     .with_object_ttl(Duration::from_secs(600))
///     .with_max_idle_time(Duration::from_secs(120))
///     .with_scale_factor(4);
///
/// assert_eq!(config.scale_factor, 4);
/// ```
pub struct AutoScaleConfig<T> {
    /// The underlying bounded-pool options.
    pub pool: PoolConfig<T>,

    /// Period of the background sweep.
    pub check_interval: Duration,

    /// Maximum payload age before a mandatory refresh.
    pub object_ttl: Duration,

    /// Idle duration after which an available entry is scaled in.
    pub max_idle_time: Duration,

    /// Entries created per miss: one for the caller plus `scale_factor - 1`
    /// in a background batch. A factor of 1 disables batch growth.
    pub scale_factor: usize,

    pub(crate) stale_checker: Option<StaleChecker<T>>,
}

impl<T> AutoScaleConfig<T> {
    pub fn new(pool: PoolConfig<T>) -> Self {
        AutoScaleConfig {
            pool,
            check_interval: DEFAULT_CHECK_INTERVAL,
            object_ttl: DEFAULT_OBJECT_TTL,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            scale_factor: 1,
            stale_checker: None,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_object_ttl(mut self, ttl: Duration) -> Self {
        self.object_ttl = ttl;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_scale_factor(mut self, factor: usize) -> Self {
        self.scale_factor = factor;
        self
    }

    /// Predicate deciding whether a payload must be replaced early.
    ///
    /// A panicking predicate is logged and treated as "not stale".
    pub fn with_stale_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stale_checker = Some(Arc::new(checker));
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        self.pool.validate()?;
        if self.check_interval.is_zero() {
            return Err(PoolError::InvalidConfig("check_interval must be positive"));
        }
        if self.object_ttl.is_zero() {
            return Err(PoolError::InvalidConfig("object_ttl must be positive"));
        }
        if self.max_idle_time.is_zero() {
            return Err(PoolError::InvalidConfig("max_idle_time must be positive"));
        }
        if self.scale_factor == 0 {
            return Err(PoolError::InvalidConfig("scale_factor must be at least 1"));
        }
        Ok(())
    }
}

impl<T> Clone for AutoScaleConfig<T> {
    fn clone(&self) -> Self {
        AutoScaleConfig {
            pool: self.pool.clone(),
            check_interval: self.check_interval,
            object_ttl: self.object_ttl,
            max_idle_time: self.max_idle_time,
            scale_factor: self.scale_factor,
            stale_checker: self.stale_checker.clone(),
        }
    }
}

impl<T> fmt::Debug for AutoScaleConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoScaleConfig")
            .field("pool", &self.pool)
            .field("check_interval", &self.check_interval)
            .field("object_ttl", &self.object_ttl)
            .field("max_idle_time", &self.max_idle_time)
            .field("scale_factor", &self.scale_factor)
            .field("has_stale_checker", &self.stale_checker.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for a bounded worker thread pool.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Worker threads spawned eagerly at construction.
    pub min_size: usize,

    /// Hard cap on worker threads.
    pub max_size: usize,
}

impl ThreadPoolConfig {
    pub fn new() -> Self {
        ThreadPoolConfig {
            min_size: 1,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig("min_size cannot exceed max_size"));
        }
        Ok(())
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for an auto-scaling worker thread pool.
///
/// # Examples
///
/// ```
/// use scalepool::AutoScaleThreadPoolConfig;
///
/// let config = AutoScaleThreadPoolConfig::new()
///     .with_min_size(2)
///     .with_max_size(8)
///     .with_queue_capacity(32);
///
/// assert_eq!(config.queue_capacity, 32);
/// ```
#[derive(Debug, Clone)]
pub struct AutoScaleThreadPoolConfig {
    /// Worker threads spawned eagerly at construction (also the scale-in floor).
    pub min_size: usize,

    /// Hard cap on worker threads.
    pub max_size: usize,

    /// Tasks parked while every worker is busy; a blocking submit waits when
    /// the queue is full.
    pub queue_capacity: usize,

    /// Period of the background sweep.
    pub check_interval: Duration,

    /// Maximum worker age before it is replaced with a fresh thread.
    pub worker_ttl: Duration,

    /// Idle duration after which a worker is scaled in.
    pub max_idle_time: Duration,

    /// Workers created per miss, one serving the caller immediately.
    pub scale_factor: usize,
}

impl AutoScaleThreadPoolConfig {
    pub fn new() -> Self {
        AutoScaleThreadPoolConfig {
            min_size: 1,
            max_size: DEFAULT_MAX_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            check_interval: DEFAULT_CHECK_INTERVAL,
            worker_ttl: DEFAULT_OBJECT_TTL,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            scale_factor: 1,
        }
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_scale_factor(mut self, factor: usize) -> Self {
        self.scale_factor = factor;
        self
    }

    pub(crate) fn validate(&self) -> PoolResult<()> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig("min_size cannot exceed max_size"));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_capacity must be at least 1",
            ));
        }
        if self.check_interval.is_zero() {
            return Err(PoolError::InvalidConfig("check_interval must be positive"));
        }
        if self.worker_ttl.is_zero() {
            return Err(PoolError::InvalidConfig("worker_ttl must be positive"));
        }
        if self.max_idle_time.is_zero() {
            return Err(PoolError::InvalidConfig("max_idle_time must be positive"));
        }
        if self.scale_factor == 0 {
            return Err(PoolError::InvalidConfig("scale_factor must be at least 1"));
        }
        Ok(())
    }
}

impl Default for AutoScaleThreadPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let config = PoolConfig::new(|| Ok(7u8))
            .with_min_size(3)
            .with_max_size(9);
        assert_eq!(config.min_size, 3);
        assert_eq!(config.max_size, 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_max_size_is_rejected() {
        let config = PoolConfig::new(|| Ok(0u8)).with_max_size(0);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let config = PoolConfig::new(|| Ok(0u8)).with_min_size(5).with_max_size(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_scale_durations_must_be_positive() {
        let base = || PoolConfig::new(|| Ok(0u8));

        let config = AutoScaleConfig::new(base()).with_check_interval(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = AutoScaleConfig::new(base()).with_object_ttl(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = AutoScaleConfig::new(base()).with_max_idle_time(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = AutoScaleConfig::new(base()).with_scale_factor(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn thread_pool_queue_capacity_must_be_positive() {
        let config = AutoScaleThreadPoolConfig::new().with_queue_capacity(0);
        assert!(config.validate().is_err());
    }
}
