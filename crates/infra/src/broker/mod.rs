//! Infrastructure broker implementations.
//!
//! The broker contract and the in-process broker live in `secx-broker`.
//! This module provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
