//! Error types for the pools

use thiserror::Error;

/// Boxed error produced by user-supplied object factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("object factory failed")]
    FactoryFailed(#[source] BoxError),

    #[error("pool is closed")]
    PoolClosed,

    #[error("entry does not belong to this pool")]
    ForeignEntry,

    #[error("entry is not in the acquired state")]
    InvalidRelease,
}

pub type PoolResult<T> = Result<T, PoolError>;
