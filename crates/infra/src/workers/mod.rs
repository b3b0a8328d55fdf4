//! Dispatcher and worker pool.

pub mod dispatcher;
pub mod pool;

pub use dispatcher::{DiscardReason, DispatchError, Dispatcher, Disposition};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
