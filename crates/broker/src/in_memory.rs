//! In-memory broker for tests/dev.
//!
//! Delayed messages carry a not-before instant that is checked at lease time,
//! and leases that are neither acked nor nacked within the visibility timeout
//! go back on the ready queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use secx_core::JobId;

use crate::broker::{Broker, BrokerError};
use crate::message::Delivery;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    job_id: JobId,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Leased {
    message: Queued,
    leased_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: VecDeque<Queued>,
    delayed: Vec<(Instant, Queued)>,
    in_flight: HashMap<String, Leased>,
}

impl State {
    /// Move due delayed messages and expired leases onto the ready queue.
    fn promote(&mut self, now: Instant, visibility_timeout: Duration) {
        let mut still_delayed = Vec::with_capacity(self.delayed.len());
        for (not_before, message) in self.delayed.drain(..) {
            if not_before <= now {
                self.ready.push_back(message);
            } else {
                still_delayed.push((not_before, message));
            }
        }
        self.delayed = still_delayed;

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, l)| now.duration_since(l.leased_at) >= visibility_timeout)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(leased) = self.in_flight.remove(&receipt) {
                debug!(job_id = %leased.message.job_id, receipt = %receipt, "lease expired; redelivering");
                self.ready.push_back(leased.message);
            }
        }
    }

    /// Earliest instant at which a delayed message or an expired lease becomes leasable.
    fn next_wakeup(&self, visibility_timeout: Duration) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let leases = self.in_flight.values().map(|l| l.leased_at + visibility_timeout);
        delayed.chain(leases).min()
    }
}

/// In-process broker.
///
/// - No IO / no async
/// - Blocking `lease` with timeout (Condvar)
/// - At-least-once: unacked leases are redelivered after the visibility timeout
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    available: Condvar,
    visibility_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    /// Messages waiting for delivery (ready or delayed), excluding leased ones.
    pub fn queued_len(&self) -> usize {
        self.lock().map(|s| s.ready.len() + s.delayed.len()).unwrap_or(0)
    }

    /// Messages currently leased and awaiting ack/nack.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn push(&self, state: &mut State, message: Queued, delay: Duration) {
        if delay.is_zero() {
            state.ready.push_back(message);
        } else {
            state.delayed.push((Instant::now() + delay, message));
        }
        // Waiters recompute their deadline even when the message is delayed.
        self.available.notify_all();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn receipt(seq: u64, delivery_count: u32) -> String {
    format!("{seq}.{delivery_count}")
}

impl Broker for InMemoryBroker {
    fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state.next_seq += 1;
        let message = Queued {
            seq: state.next_seq,
            job_id,
            delivery_count: 0,
            enqueued_at: Utc::now(),
        };
        self.push(&mut state, message, delay);
        Ok(())
    }

    fn lease(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;

        loop {
            let now = Instant::now();
            state.promote(now, self.visibility_timeout);

            if let Some(mut message) = state.ready.pop_front() {
                message.delivery_count += 1;
                let delivery = Delivery {
                    message_id: receipt(message.seq, message.delivery_count),
                    job_id: message.job_id,
                    delivery_count: message.delivery_count,
                    enqueued_at: message.enqueued_at,
                };
                state.in_flight.insert(
                    delivery.message_id.clone(),
                    Leased {
                        message,
                        leased_at: now,
                    },
                );
                return Ok(Some(delivery));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = state
                .next_wakeup(self.visibility_timeout)
                .map_or(deadline, |at| at.min(deadline));
            let wait = wake_at.saturating_duration_since(now).max(Duration::from_millis(1));

            state = self
                .available
                .wait_timeout(state, wait)
                .map_err(|_| BrokerError::Poisoned)?
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        state
            .in_flight
            .remove(&delivery.message_id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.message_id.clone()))
    }

    fn nack(&self, delivery: &Delivery, requeue_delay: Duration) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let leased = state
            .in_flight
            .remove(&delivery.message_id)
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.message_id.clone()))?;
        self.push(&mut state, leased.message, requeue_delay);
        Ok(())
    }
}
