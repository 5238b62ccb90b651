//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `bulkjobs:jobs` (one entry per work unit, field `payload`)
//! - **Consumer Group**: `bulkjobs-workers`; every worker process joins it
//!   under a unique consumer name
//! - **Delayed Set**: `bulkjobs:jobs:delayed`, a sorted set scored by the
//!   epoch millisecond at which a retried unit becomes ready again
//! - **Dead-Letter Queue**: `bulkjobs:jobs:dlq` (units out of attempts)
//!
//! An entry is owned by its consumer from XREADGROUP until it is settled
//! (XACK + XDEL). Entries left pending by a crashed consumer are reclaimed
//! with XAUTOCLAIM once they have been idle for `claim_idle`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::jobs::{Delivery, JobQueue, QueueError, WorkUnit};

const DEFAULT_STREAM_KEY: &str = "bulkjobs:jobs";
const DEFAULT_GROUP: &str = "bulkjobs-workers";
const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(300);

/// How many due retries one dequeue promotes back onto the stream.
const PROMOTE_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
}

impl RedisJobQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `consumer` - Unique consumer name within the group (e.g., "worker-1")
    pub fn new(redis_url: impl AsRef<str>, consumer: impl Into<String>) -> Result<Self, QueueError> {
        Self::with_keys(redis_url, consumer, DEFAULT_STREAM_KEY)
    }

    /// Like [`RedisJobQueue::new`] with a custom stream key; the delayed set
    /// and DLQ keys are derived from it.
    pub fn with_keys(
        redis_url: impl AsRef<str>,
        consumer: impl Into<String>,
        stream_key: &str,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| QueueError::Connection(e.to_string()))?;

        let queue = Self {
            client: Arc::new(client),
            stream_key: stream_key.to_string(),
            delayed_key: format!("{stream_key}:delayed"),
            dlq_key: format!("{stream_key}:dlq"),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            claim_idle: DEFAULT_CLAIM_IDLE,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group is fine.
    fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Move retries whose delay has elapsed back onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("ZRANGEBYSCORE failed: {e}")))?;

        for member in due {
            // Only the consumer whose ZREM wins re-adds the unit.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query(conn)
                .map_err(|e| QueueError::Command(format!("ZREM failed: {e}")))?;
            if removed == 1 {
                let _: String = redis::cmd("XADD")
                    .arg(&self.stream_key)
                    .arg("*")
                    .arg("payload")
                    .arg(&member)
                    .query(conn)
                    .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
            }
        }
        Ok(())
    }

    /// Take over one entry another consumer left pending for too long.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next_cursor, [entry, ...], (deleted ids)]
        let entries = match reply {
            redis::Value::Bulk(mut parts) if parts.len() >= 2 => parts.swap_remove(1),
            _ => return Ok(None),
        };
        let delivery = first_delivery(entries)?;
        if let Some(delivery) = &delivery {
            warn!(receipt = %delivery.receipt, job_id = %delivery.unit.job_id, "reclaimed stale delivery");
        }
        Ok(delivery)
    }

    fn read_new(&self, conn: &mut redis::Connection, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        // BLOCK 0 would wait forever.
        let block_ms = timeout.as_millis().max(1) as u64;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: [[stream_key, [entry, ...]]] or nil on timeout
        let streams = match reply {
            redis::Value::Bulk(streams) => streams,
            _ => return Ok(None),
        };
        for stream in streams {
            if let redis::Value::Bulk(mut parts) = stream {
                if parts.len() == 2 {
                    return first_delivery(parts.swap_remove(1));
                }
            }
        }
        Ok(None)
    }

    /// Remove the entry from the group's pending list and from the stream.
    fn settle(&self, pipe: &mut redis::Pipeline, receipt: &str) {
        pipe.cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(receipt)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt)
            .ignore();
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, unit), fields(stream_key = %self.stream_key, job_id = %unit.job_id), err)]
    fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        let payload = encode(&unit)?;
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;

        if let Some(delivery) = self.claim_stale(&mut conn)? {
            return Ok(Some(delivery));
        }
        self.read_new(&mut conn, timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle(&mut pipe, &delivery.receipt);
        pipe.query::<()>(&mut conn)
            .map_err(|e| QueueError::Command(format!("ack failed: {e}")))?;
        debug!(receipt = %delivery.receipt, "delivery acknowledged");
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.unit.job_id, attempt = delivery.unit.attempt), err)]
    fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let payload = encode(&delivery.unit.next_attempt())?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle(&mut pipe, &delivery.receipt);
        pipe.cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(ready_at)
            .arg(&payload)
            .ignore();
        pipe.query::<()>(&mut conn)
            .map_err(|e| QueueError::Command(format!("retry failed: {e}")))?;
        Ok(())
    }

    /// XCLAIM to ourselves with JUSTID resets the entry's idle time, which
    /// keeps XAUTOCLAIM in other consumers away from it. The XPENDING check
    /// stops us from pulling back an entry another consumer already reclaimed.
    fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection()?;

        let pending: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .arg(&delivery.receipt)
            .arg(1)
            .arg(&self.consumer)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;
        if !is_non_empty(&pending) {
            return Err(QueueError::LeaseLost(delivery.receipt.clone()));
        }

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&delivery.receipt)
            .arg("JUSTID")
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;
        if !is_non_empty(&claimed) {
            return Err(QueueError::LeaseLost(delivery.receipt.clone()));
        }

        debug!(receipt = %delivery.receipt, "delivery lease renewed");
        Ok(())
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let payload = encode(&delivery.unit)?;

        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.settle(&mut pipe, &delivery.receipt);
        pipe.cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&delivery.receipt)
            .arg("attempts")
            .arg(delivery.unit.attempt)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .ignore();
        pipe.query::<()>(&mut conn)
            .map_err(|e| QueueError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(
            message_id = %delivery.receipt,
            job_id = %delivery.unit.job_id,
            attempts = delivery.unit.attempt,
            "unit sent to dead-letter queue"
        );
        Ok(())
    }
}

/// Whether a multi-bulk reply has at least one element.
fn is_non_empty(reply: &redis::Value) -> bool {
    matches!(reply, redis::Value::Bulk(items) if !items.is_empty())
}

fn encode(unit: &WorkUnit) -> Result<String, QueueError> {
    serde_json::to_string(unit).map_err(|e| QueueError::Codec(e.to_string()))
}

/// First entry of an entry list: `[[message_id, [field, value, ...]], ...]`.
fn first_delivery(entries: redis::Value) -> Result<Option<Delivery>, QueueError> {
    match entries {
        redis::Value::Bulk(entries) => match entries.into_iter().next() {
            Some(entry) => parse_entry(entry).map(Some),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

fn parse_entry(entry: redis::Value) -> Result<Delivery, QueueError> {
    let mut parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts.into_iter(),
        _ => return Err(QueueError::Codec("invalid stream entry".to_string())),
    };

    let receipt = match parts.next() {
        Some(redis::Value::Data(id)) => String::from_utf8_lossy(&id).to_string(),
        _ => return Err(QueueError::Codec("invalid message id".to_string())),
    };

    let fields = match parts.next() {
        Some(redis::Value::Bulk(fields)) => fields,
        _ => return Err(QueueError::Codec(format!("invalid fields for {receipt}"))),
    };

    let mut map = HashMap::new();
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            map.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let payload = map
        .get("payload")
        .ok_or_else(|| QueueError::Codec(format!("missing payload field in {receipt}")))?;
    let unit: WorkUnit = serde_json::from_str(payload)
        .map_err(|e| QueueError::Codec(format!("failed to decode {receipt}: {e}")))?;

    Ok(Delivery { receipt, unit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkjobs_core::{JobId, JobPayload, TicketId};

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    fn unit() -> WorkUnit {
        WorkUnit::new(JobId::new(), JobPayload::bulk_delete(vec![TicketId::new(1), TicketId::new(2)]).unwrap())
    }

    #[test]
    fn parses_stream_entry_into_delivery() {
        let unit = unit();
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![data("payload"), data(&encode(&unit).unwrap())]),
        ]);

        let delivery = first_delivery(redis::Value::Bulk(vec![entry])).unwrap().unwrap();

        assert_eq!(delivery.receipt, "1700000000000-0");
        assert_eq!(delivery.unit, unit);
    }

    #[test]
    fn empty_entry_list_is_no_delivery() {
        assert_eq!(first_delivery(redis::Value::Bulk(vec![])).unwrap(), None);
        assert_eq!(first_delivery(redis::Value::Nil).unwrap(), None);
    }

    #[test]
    fn entry_without_payload_is_a_codec_error() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("other"), data("x")]),
        ]);
        assert!(matches!(parse_entry(entry), Err(QueueError::Codec(_))));
    }

    #[test]
    fn empty_or_nil_reply_means_not_owned() {
        assert!(!is_non_empty(&redis::Value::Nil));
        assert!(!is_non_empty(&redis::Value::Bulk(vec![])));
        assert!(is_non_empty(&redis::Value::Bulk(vec![redis::Value::Data(b"1-0".to_vec())])));
    }

    #[test]
    #[ignore = "requires REDIS_URL"]
    fn retry_then_ack_round_trip() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let stream = format!("bulkjobs:test:{}", uuid::Uuid::now_v7());
        let queue = RedisJobQueue::with_keys(&url, "test-consumer", &stream).unwrap();

        let unit = unit();
        queue.enqueue(unit.clone()).unwrap();
        let first = queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(first.unit, unit);

        queue.retry(&first, Duration::ZERO).unwrap();
        let second = queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(second.unit.attempt, 2);

        queue.ack(&second).unwrap();
        assert_eq!(queue.dequeue(Duration::from_millis(50)).unwrap(), None);
    }

    #[test]
    #[ignore = "requires REDIS_URL"]
    fn touched_delivery_is_not_reclaimed_by_another_consumer() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
        let stream = format!("bulkjobs:test:{}", uuid::Uuid::now_v7());
        let owner = RedisJobQueue::with_keys(&url, "owner", &stream)
            .unwrap()
            .with_claim_idle(Duration::from_millis(200));
        let other = RedisJobQueue::with_keys(&url, "other", &stream)
            .unwrap()
            .with_claim_idle(Duration::from_millis(200));

        owner.enqueue(unit()).unwrap();
        let delivery = owner.dequeue(Duration::from_millis(100)).unwrap().unwrap();

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(120));
            owner.touch(&delivery).unwrap();
        }
        assert_eq!(other.dequeue(Duration::from_millis(10)).unwrap(), None);

        // Left alone past the idle limit, the entry moves and the owner loses it.
        std::thread::sleep(Duration::from_millis(250));
        let stolen = other.dequeue(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(stolen.receipt, delivery.receipt);
        assert!(matches!(owner.touch(&delivery), Err(QueueError::LeaseLost(_))));
        other.ack(&stolen).unwrap();
    }
}
