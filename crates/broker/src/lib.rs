//! `secx-broker`: message broker contract for extraction jobs.
//!
//! Messages carry nothing but a [`JobId`](secx_core::JobId); the job store is
//! the source of truth for everything else. Delivery is **at-least-once**:
//! consumers must tolerate the same job id arriving more than once.

pub mod broker;
pub mod in_memory;
pub mod message;

pub use broker::{Broker, BrokerError};
pub use in_memory::InMemoryBroker;
pub use message::Delivery;
