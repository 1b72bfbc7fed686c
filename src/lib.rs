//! # scalepool
//!
//! Bounded and auto-scaling object pools for heavyweight objects, with a
//! worker thread-pool facade built on top.
//!
//! ## Features
//!
//! - Bounded pool with lazy creation up to `max_size` and `min_size` prewarm
//! - Blocking `acquire` with fail-fast `try_acquire`
//! - Explicit `release` with misuse detection (foreign or mis-stated entries)
//! - Auto-scaling pool: batched scale-out on miss, idle scale-in down to
//!   `min_size`, TTL and staleness-driven payload refresh
//! - Worker thread pools as direct specializations of both pool variants,
//!   the auto-scaling one with a bounded task intake queue
//! - Structured diagnostics via `tracing`, metrics snapshots per pool
//!
//! ## Quick Start
//!
//! ```rust
//! use scalepool::{ObjectPool, PoolConfig};
//!
//! let config = PoolConfig::new(|| Ok(String::from("connection")))
//!     .with_min_size(1)
//!     .with_max_size(4);
//! let pool = ObjectPool::new(config).unwrap();
//!
//! let entry = pool.acquire().unwrap();
//! assert_eq!(entry.object(), "connection");
//! pool.release(entry).unwrap();
//! ```
//!
//! Running tasks on pooled workers:
//!
//! ```rust
//! use scalepool::{AutoScaleThreadPool, AutoScaleThreadPoolConfig};
//!
//! let pool = AutoScaleThreadPool::new(
//!     AutoScaleThreadPoolConfig::new().with_max_size(4),
//! )
//! .unwrap();
//! pool.submit(|| println!("running on a pooled worker")).unwrap();
//! pool.close();
//! ```

mod autoscale;
mod config;
mod entry;
mod errors;
mod metrics;
mod pool;
mod sync;
mod thread_pool;

pub use autoscale::AutoScaleObjectPool;
pub use config::{AutoScaleConfig, AutoScaleThreadPoolConfig, PoolConfig, ThreadPoolConfig};
pub use entry::Entry;
pub use errors::{BoxError, PoolError, PoolResult};
pub use metrics::PoolMetrics;
pub use pool::ObjectPool;
pub use thread_pool::{AutoScaleThreadPool, ThreadPool};
