//! Broker abstraction (enqueue / lease / ack / nack).
//!
//! The broker sits between whoever creates jobs and the workers that run them:
//!
//! ```text
//! Coordinator / Scheduler ──enqueue──► Broker ──lease──► Worker
//!                                        ▲                 │
//!                                        └──── ack/nack ───┘
//! ```
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a message that is not acked is eventually redelivered
//!   (after a nack delay, or after the lease's visibility timeout lapses)
//! - **No ordering** between different jobs
//! - **Delayed delivery**: `enqueue` and `nack` accept a delay; the message is
//!   not leased before it elapses
//!
//! Duplicate deliveries are expected. Workers resolve them through the job
//! store's compare-and-swap transitions, never by coordinating with each other.

use std::sync::Arc;
use std::time::Duration;

use secx_core::JobId;

use crate::message::Delivery;

/// Broker failure. Connectivity problems are transient; callers retry through
/// redelivery rather than swallowing them.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("malformed message {message_id}: {reason}")]
    Malformed { message_id: String, reason: String },

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("broker state poisoned")]
    Poisoned,
}

/// Broker client used by producers and workers.
pub trait Broker: Send + Sync {
    /// Publish a message for `job_id`, visible after `delay`.
    fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for a message. `Ok(None)` means the wait timed out.
    fn lease(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Mark a leased message as permanently consumed.
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Return a leased message for redelivery after `requeue_delay`.
    fn nack(&self, delivery: &Delivery, requeue_delay: Duration) -> Result<(), BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), BrokerError> {
        (**self).enqueue(job_id, delay)
    }

    fn lease(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).lease(timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery)
    }

    fn nack(&self, delivery: &Delivery, requeue_delay: Duration) -> Result<(), BrokerError> {
        (**self).nack(delivery, requeue_delay)
    }
}
