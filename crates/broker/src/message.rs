//! Leased broker messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use secx_core::JobId;

/// A message leased by one consumer, pending `ack` or `nack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Broker-assigned receipt; identifies this lease for ack/nack.
    pub message_id: String,
    pub job_id: JobId,
    /// How many times this message has been handed out (1 on first lease).
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
