//! Redis queue integration tests.
//!
//! Requires a running Redis. Each test owns one logical database and flushes
//! it first. Run with:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p jonche-notifier --test integration -- --ignored --nocapture
//! ```

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use jonche_common::redis_pool::create_redis_pool;
use jonche_common::types::{QueueClass, SendSmsPayload};
use jonche_notifier::queue::{QueueBackend, RedisQueue, TaskEnvelope};

async fn connect(db: u8) -> ConnectionManager {
    let base = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let mut conn = create_redis_pool(&format!("{}/{}", base.trim_end_matches('/'), db))
        .await
        .unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();
    conn
}

fn envelope(queue: QueueClass) -> TaskEnvelope {
    TaskEnvelope::new(
        queue,
        3,
        SendSmsPayload {
            phone_numbers: vec!["254712345678".into()],
            messages: vec!["hello".into()],
            ref_ids: vec![Uuid::new_v4()],
        },
    )
}

#[tokio::test]
#[ignore]
async fn test_due_retry_promoted_back_onto_its_lane() {
    let mut conn = connect(13).await;
    let queue = RedisQueue::new(conn.clone());

    let raw = envelope(QueueClass::Default).encode().unwrap();
    queue.push(QueueClass::Default, raw.clone()).await.unwrap();
    let reservation = queue.reserve(QueueClass::Default).await.unwrap().unwrap();

    let first = TaskEnvelope::decode(&raw).unwrap();
    let retry = first.next_attempt(first.payload.clone()).encode().unwrap();
    queue
        .schedule_retry(&reservation, retry.clone(), Duration::ZERO)
        .await
        .unwrap();

    let inflight: usize = conn.llen("jonche:queue:default:inflight").await.unwrap();
    assert_eq!(inflight, 0);

    assert_eq!(queue.promote_due().await.unwrap(), 1);

    let scheduled: usize = conn.zcard("jonche:queue:retry").await.unwrap();
    assert_eq!(scheduled, 0);
    let next = queue.reserve(QueueClass::Default).await.unwrap().unwrap();
    assert_eq!(next.raw, retry);
    assert_eq!(TaskEnvelope::decode(&next.raw).unwrap().retried, 1);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_promoters_move_each_retry_once() {
    let mut conn = connect(14).await;
    let queue = RedisQueue::new(conn.clone());

    for _ in 0..20 {
        let raw = envelope(QueueClass::Critical).encode().unwrap();
        queue.push(QueueClass::Critical, raw).await.unwrap();
        let reservation = queue.reserve(QueueClass::Critical).await.unwrap().unwrap();
        let raw = reservation.raw.clone();
        queue
            .schedule_retry(&reservation, raw, Duration::ZERO)
            .await
            .unwrap();
    }

    let promoters: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.promote_due().await.unwrap() })
        })
        .collect();
    let mut promoted = 0;
    for promoter in promoters {
        promoted += promoter.await.unwrap();
    }

    assert_eq!(promoted, 20);
    let pending: usize = conn.llen("jonche:queue:critical").await.unwrap();
    assert_eq!(pending, 20);
    let scheduled: usize = conn.zcard("jonche:queue:retry").await.unwrap();
    assert_eq!(scheduled, 0);
}

#[tokio::test]
#[ignore]
async fn test_retry_not_yet_due_stays_scheduled() {
    let mut conn = connect(15).await;
    let queue = RedisQueue::new(conn.clone());

    let raw = envelope(QueueClass::Low).encode().unwrap();
    queue.push(QueueClass::Low, raw).await.unwrap();
    let reservation = queue.reserve(QueueClass::Low).await.unwrap().unwrap();
    let raw = reservation.raw.clone();
    queue
        .schedule_retry(&reservation, raw, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(queue.promote_due().await.unwrap(), 0);
    let scheduled: usize = conn.zcard("jonche:queue:retry").await.unwrap();
    assert_eq!(scheduled, 1);
    let pending: usize = conn.llen("jonche:queue:low").await.unwrap();
    assert_eq!(pending, 0);
}
