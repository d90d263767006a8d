//! Durable priority work queue.
//!
//! Each lane is a Redis list. Reserving a task moves it atomically (`LMOVE`)
//! into the lane's in-flight list, so a consumer that dies mid-task leaves the
//! task behind for [`QueueBackend::requeue_inflight`] instead of losing it.
//! Retries wait in a sorted set scored by due time until
//! [`QueueBackend::promote_due`] moves them back onto their lane.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::{QueueClass, SendSmsPayload};

/// Task kind carried by every envelope this crate produces.
pub const SEND_SMS_TASK: &str = "task:send_sms";

/// Maximum retries promoted per `promote_due` call.
const PROMOTE_BATCH: isize = 100;

/// Remove a retry entry and push its envelope onto the lane in one step.
/// Returns 1 when this caller won the entry.
const PROMOTE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid task payload: {0}")]
    Validation(String),

    #[error("queue unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("malformed task envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(msg) => AppError::Validation(msg),
            other => AppError::Queue(other.to_string()),
        }
    }
}

/// What travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: String,
    pub queue: QueueClass,
    pub max_retry: u32,
    /// Number of retries already spent.
    pub retried: u32,
    pub payload: SendSmsPayload,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(queue: QueueClass, max_retry: u32, payload: SendSmsPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SEND_SMS_TASK.to_string(),
            queue,
            max_retry,
            retried: 0,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }

    /// The envelope for the next attempt, carrying only `payload`.
    pub fn next_attempt(&self, payload: SendSmsPayload) -> Self {
        Self {
            retried: self.retried + 1,
            payload,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A task taken off a lane but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub queue: QueueClass,
    /// The exact encoded envelope, used to acknowledge it.
    pub raw: String,
}

/// Storage behind the work queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append an encoded envelope to a lane.
    async fn push(&self, queue: QueueClass, raw: String) -> Result<(), QueueError>;

    /// Take the oldest task off a lane, or `None` when the lane is empty.
    async fn reserve(&self, queue: QueueClass) -> Result<Option<Reservation>, QueueError>;

    /// Mark a reserved task done.
    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError>;

    /// Replace a reserved task with `raw`, due after `delay`.
    async fn schedule_retry(
        &self,
        reservation: &Reservation,
        raw: String,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Move retries whose delay has elapsed back onto their lanes.
    async fn promote_due(&self) -> Result<usize, QueueError>;

    /// Return tasks stranded in flight by a previous process to their lanes.
    async fn requeue_inflight(&self) -> Result<usize, QueueError>;
}

/// Redis-backed queue.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            namespace: "jonche".to_string(),
        }
    }

    fn pending_key(&self, queue: QueueClass) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn inflight_key(&self, queue: QueueClass) -> String {
        format!("{}:queue:{}:inflight", self.namespace, queue)
    }

    fn retry_key(&self) -> String {
        format!("{}:queue:retry", self.namespace)
    }
}

/// Retry set members are `<lane>|<envelope>`.
fn retry_member(queue: QueueClass, raw: &str) -> String {
    format!("{}|{}", queue, raw)
}

fn parse_retry_member(member: &str) -> Option<(QueueClass, &str)> {
    let (lane, raw) = member.split_once('|')?;
    let queue = QueueClass::ALL.into_iter().find(|q| q.as_str() == lane)?;
    Some((queue, raw))
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, queue: QueueClass, raw: String) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.pending_key(queue), raw).await?;
        Ok(())
    }

    async fn reserve(&self, queue: QueueClass) -> Result<Option<Reservation>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(self.pending_key(queue))
            .arg(self.inflight_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        Ok(raw.map(|raw| Reservation { queue, raw }))
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.inflight_key(reservation.queue), 1, &reservation.raw)
            .await?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        reservation: &Reservation,
        raw: String,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let _: () = redis::pipe()
            .atomic()
            .zadd(self.retry_key(), retry_member(reservation.queue, &raw), due)
            .ignore()
            .lrem(self.inflight_key(reservation.queue), 1, &reservation.raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.retry_key())
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        let script = redis::Script::new(PROMOTE_SCRIPT);
        let mut promoted = 0;
        for member in members {
            let Some((queue, raw)) = parse_retry_member(&member) else {
                let _: i64 = conn.zrem(self.retry_key(), &member).await?;
                tracing::error!(member = %member, "Dropping unreadable retry entry");
                continue;
            };

            // Only the process whose ZREM succeeds re-queues the task.
            let moved: i64 = script
                .key(self.retry_key())
                .key(self.pending_key(queue))
                .arg(&member)
                .arg(raw)
                .invoke_async(&mut conn)
                .await?;
            if moved == 1 {
                promoted += 1;
            }
        }

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted due retries");
        }
        Ok(promoted)
    }

    async fn requeue_inflight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut requeued = 0;

        for queue in QueueClass::ALL {
            loop {
                // Back onto the consuming end so stranded tasks run first.
                let moved: Option<String> = redis::cmd("LMOVE")
                    .arg(self.inflight_key(queue))
                    .arg(self.pending_key(queue))
                    .arg("RIGHT")
                    .arg("RIGHT")
                    .query_async(&mut conn)
                    .await?;
                if moved.is_none() {
                    break;
                }
                requeued += 1;
            }
        }

        if requeued > 0 {
            tracing::warn!(requeued, "Requeued tasks left in flight by a previous worker");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> SendSmsPayload {
        SendSmsPayload {
            phone_numbers: vec!["0712345678".to_string(), "0722000000".to_string()],
            messages: vec!["one".to_string(), "two".to_string()],
            ref_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
        }
    }

    #[test]
    fn test_envelope_retry_accounting() {
        let envelope = TaskEnvelope::new(QueueClass::Critical, 2, payload());
        assert!(!envelope.retries_exhausted());

        let second = envelope.next_attempt(envelope.payload.subset(&[1]));
        assert_eq!(second.id, envelope.id);
        assert_eq!(second.retried, 1);
        assert_eq!(second.payload.messages, vec!["two"]);

        let third = second.next_attempt(second.payload.clone());
        assert!(third.retries_exhausted());
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(matches!(
            TaskEnvelope::decode("{\"id\": 1}"),
            Err(QueueError::Malformed(_))
        ));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = TaskEnvelope::new(QueueClass::Low, 3, payload());
        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], SEND_SMS_TASK);
        assert_eq!(json["queue"], "low");
        assert_eq!(json["payload"]["messages"][1], "two");
    }

    #[test]
    fn test_retry_member_round_trip() {
        let member = retry_member(QueueClass::Default, "{\"a\":\"b|c\"}");
        let (queue, raw) = parse_retry_member(&member).unwrap();
        assert_eq!(queue, QueueClass::Default);
        assert_eq!(raw, "{\"a\":\"b|c\"}");
        assert!(parse_retry_member("urgent|{}").is_none());
    }

    #[test]
    fn test_validation_maps_to_app_validation() {
        let err: AppError = QueueError::Validation("lengths differ".into()).into();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
