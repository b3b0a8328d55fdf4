//! Infrastructure layer: job store, broker adapters, scheduler, workers.
//!
//! ```text
//! JobCoordinator ─┐                         ┌─► Extractor (untrusted)
//!                 ├─► JobStore ◄─── Dispatcher ◄── WorkerPool
//! Scheduler ──────┘      ▲                  │
//!        │               │                  ▼
//!        └──────────► Broker ◄──── lease / ack / nack
//! ```
//!
//! The job store is the only authority on job state. Workers hold nothing
//! across messages: every decision is re-derived from a fresh read or a
//! compare-and-swap transition.

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod filings;
pub mod jobs;
pub mod scheduler;
pub mod workers;


#[cfg(feature = "redis")]
pub use broker::RedisStreamsBroker;
pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{BatchFailure, BatchSummary, CoordinatorError, JobCoordinator};
pub use filings::{FilingMetadata, FilingSource, FilingSourceError, PostgresFilingSource, StaticFilingSource};
pub use jobs::{InMemoryJobStore, JobStats, JobStore, JobStoreError, PostgresJobStore, TransitionFields};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerStats, SweepReport};
pub use workers::{
    DiscardReason, DispatchError, Dispatcher, Disposition, PoolStats, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};
