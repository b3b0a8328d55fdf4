//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream** `secx:jobs`: ready messages, one entry per dispatch request
//! - **Consumer group** `secx:workers`: every worker process reads through it,
//!   so each entry goes to one consumer at a time
//! - **Sorted set** `secx:jobs:delayed`: delayed messages scored by their
//!   not-before time (unix ms); due members are moved onto the stream by a
//!   Lua script at the start of every `lease`
//!
//! ## Redelivery
//!
//! - `nack` acks the current entry and schedules a fresh one in the same
//!   script, carrying the delivery count forward
//! - Entries left pending longer than the visibility timeout are taken over
//!   with `XAUTOCLAIM`
//!
//! Fields per entry: `job_id`, `deliveries` (prior deliveries), `enqueued_at`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use secx_broker::{Broker, BrokerError, Delivery};
use secx_core::JobId;

const DEFAULT_STREAM_KEY: &str = "secx:jobs";
const DEFAULT_GROUP: &str = "secx:workers";
const DELAYED_SUFFIX: &str = ":delayed";

/// Entries pending longer than this are reclaimed by another consumer.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Longest single `XREADGROUP BLOCK`; bounds how late a delayed message is promoted.
const MAX_BLOCK: Duration = Duration::from_secs(1);

/// Delayed members promoted per lease call.
const PROMOTE_BATCH: usize = 100;

/// Move due members of the delayed set onto the stream.
///
/// KEYS[1] = delayed set, KEYS[2] = stream; ARGV[1] = now (ms), ARGV[2] = batch size
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local m = cjson.decode(member)
    redis.call('XADD', KEYS[2], '*',
      'job_id', m.job_id,
      'deliveries', tostring(m.deliveries),
      'enqueued_at', m.enqueued_at)
    moved = moved + 1
  end
end
return moved
"#;

/// Ack an entry and schedule its replacement, only if the entry is still pending.
///
/// KEYS[1] = stream, KEYS[2] = delayed set
/// ARGV = group, entry id, job id, deliveries, enqueued_at, not-before (ms, 0 = now), delayed member
const NACK_SCRIPT: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
if tonumber(ARGV[6]) == 0 then
  redis.call('XADD', KEYS[1], '*', 'job_id', ARGV[3], 'deliveries', ARGV[4], 'enqueued_at', ARGV[5])
else
  redis.call('ZADD', KEYS[2], tonumber(ARGV[6]), ARGV[7])
end
return 1
"#;

/// Delayed-set member. The nonce keeps members unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DelayedMember {
    job_id: String,
    deliveries: u32,
    enqueued_at: String,
    nonce: String,
}

impl DelayedMember {
    fn new(job_id: JobId, deliveries: u32, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_string(),
            deliveries,
            enqueued_at: enqueued_at.to_rfc3339(),
            nonce: uuid::Uuid::now_v7().to_string(),
        }
    }

    fn encode(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::Command(format!("encode delayed member: {e}")))
    }
}

/// A stream entry as read from Redis.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    promote: Arc<redis::Script>,
    nack: Arc<redis::Script>,
}

impl RedisStreamsBroker {
    /// Connect and make sure the stream and consumer group exist.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            delayed_key: format!("{DEFAULT_STREAM_KEY}{DELAYED_SUFFIX}"),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("secx-{}", uuid::Uuid::now_v7()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            promote: Arc::new(redis::Script::new(PROMOTE_SCRIPT)),
            nack: Arc::new(redis::Script::new(NACK_SCRIPT)),
        };
        broker.ensure_consumer_group()?;
        Ok(broker)
    }

    /// Use a different stream (and delayed set) key, e.g. to isolate tests.
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Result<Self, BrokerError> {
        self.stream_key = stream_key.into();
        self.delayed_key = format!("{}{DELAYED_SUFFIX}", self.stream_key);
        self.ensure_consumer_group()?;
        Ok(self)
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Create the consumer group (and stream) if missing. Idempotent.
    pub fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn add_entry(
        &self,
        conn: &mut redis::Connection,
        job_id: JobId,
        deliveries: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .arg("deliveries")
            .arg(deliveries)
            .arg("enqueued_at")
            .arg(enqueued_at.to_rfc3339())
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), BrokerError> {
        let moved: u64 = self
            .promote
            .key(&self.delayed_key)
            .key(&self.stream_key)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke(conn)
            .map_err(|e| BrokerError::Command(format!("promote delayed failed: {e}")))?;
        if moved > 0 {
            debug!(moved, "promoted delayed messages");
        }
        Ok(())
    }

    /// Take over one entry whose lease has lapsed.
    fn reclaim_expired(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, BrokerError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next-cursor, [entries...], (deleted ids, Redis >= 7)]
        let entries = match reply {
            redis::Value::Bulk(mut parts) if parts.len() >= 2 => parse_entries(parts.swap_remove(1))?,
            _ => Vec::new(),
        };
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let pel_count = self.pending_delivery_count(conn, &entry.id)?.unwrap_or(2);
        warn!(message_id = %entry.id, "reclaimed message after visibility timeout");
        to_delivery(entry, pel_count).map(Some)
    }

    /// Times the group has handed out `entry_id`, from the pending entries list.
    fn pending_delivery_count(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
    ) -> Result<Option<u32>, BrokerError> {
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XPENDING failed: {e}")))?;
        Ok(parse_pending_count(&reply))
    }

    fn read_new(&self, conn: &mut redis::Connection, block: Duration) -> Result<Option<Delivery>, BrokerError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: nil on timeout, else [[stream, [entries...]]]
        let entries = match reply {
            redis::Value::Bulk(streams) => {
                let mut entries = Vec::new();
                for stream in streams {
                    if let redis::Value::Bulk(mut pair) = stream {
                        if pair.len() == 2 {
                            entries.extend(parse_entries(pair.swap_remove(1))?);
                        }
                    }
                }
                entries
            }
            _ => Vec::new(),
        };

        match entries.into_iter().next() {
            Some(entry) => to_delivery(entry, 1).map(Some),
            None => Ok(None),
        }
    }
}

impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn enqueue(&self, job_id: JobId, delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let now = Utc::now();

        if delay.is_zero() {
            return self.add_entry(&mut conn, job_id, 0, now);
        }

        let member = DelayedMember::new(job_id, 0, now).encode()?;
        let _: u64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(not_before_ms(now, delay))
            .arg(member)
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    fn lease(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.connection()?;

        loop {
            self.promote_due(&mut conn)?;

            if let Some(delivery) = self.reclaim_expired(&mut conn)? {
                return Ok(Some(delivery));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(delivery) = self.read_new(&mut conn, remaining.min(MAX_BLOCK))? {
                return Ok(Some(delivery));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id), err)]
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.message_id)
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("XACK failed: {e}")))?;

        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.message_id.clone()));
        }

        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&delivery.message_id)
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id), err)]
    fn nack(&self, delivery: &Delivery, requeue_delay: Duration) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let now = Utc::now();

        let member = DelayedMember::new(delivery.job_id, delivery.delivery_count, delivery.enqueued_at);
        let not_before = if requeue_delay.is_zero() {
            0
        } else {
            not_before_ms(now, requeue_delay)
        };

        let requeued: u64 = self
            .nack
            .key(&self.stream_key)
            .key(&self.delayed_key)
            .arg(&self.group)
            .arg(&delivery.message_id)
            .arg(&member.job_id)
            .arg(member.deliveries)
            .arg(&member.enqueued_at)
            .arg(not_before)
            .arg(member.encode()?)
            .invoke(&mut conn)
            .map_err(|e| BrokerError::Command(format!("nack failed: {e}")))?;

        if requeued == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.message_id.clone()));
        }
        Ok(())
    }
}

fn not_before_ms(now: DateTime<Utc>, delay: Duration) -> i64 {
    now.timestamp_millis()
        .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

fn data_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[[id, [field, value, ...]], ...]`; nil entries (deleted ids) are skipped.
fn parse_entries(value: redis::Value) -> Result<Vec<StreamEntry>, BrokerError> {
    let redis::Value::Bulk(raw_entries) = value else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let redis::Value::Bulk(parts) = raw else { continue };
        if parts.len() < 2 {
            continue;
        }

        let id = data_to_string(&parts[0]).ok_or_else(|| BrokerError::Malformed {
            message_id: "?".into(),
            reason: "invalid entry id".into(),
        })?;

        let mut fields = HashMap::new();
        if let redis::Value::Bulk(kv) = &parts[1] {
            for chunk in kv.chunks(2) {
                if let [key, value] = chunk {
                    if let (Some(key), Some(value)) = (data_to_string(key), data_to_string(value)) {
                        fields.insert(key, value);
                    }
                }
            }
        }

        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}

/// Delivery count of the single entry in an extended `XPENDING` reply.
fn parse_pending_count(reply: &redis::Value) -> Option<u32> {
    let redis::Value::Bulk(rows) = reply else { return None };
    let redis::Value::Bulk(row) = rows.first()? else { return None };
    match row.get(3)? {
        redis::Value::Int(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

fn to_delivery(entry: StreamEntry, pel_count: u32) -> Result<Delivery, BrokerError> {
    let malformed = |reason: String| BrokerError::Malformed {
        message_id: entry.id.clone(),
        reason,
    };

    let job_id = entry
        .fields
        .get("job_id")
        .ok_or_else(|| malformed("missing job_id".into()))?
        .parse::<JobId>()
        .map_err(|e| malformed(format!("invalid job_id: {e}")))?;

    let prior: u32 = entry
        .fields
        .get("deliveries")
        .map(|d| d.parse::<u32>())
        .transpose()
        .map_err(|e| malformed(format!("invalid deliveries: {e}")))?
        .unwrap_or(0);

    let enqueued_at = entry
        .fields
        .get("enqueued_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Delivery {
        message_id: entry.id.clone(),
        job_id,
        delivery_count: prior.saturating_add(pel_count.max(1)),
        enqueued_at,
    })
}
