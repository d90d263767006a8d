//! Transactional outbox for SMS enqueue intents.
//!
//! The ledger writes an intent row in the same transaction as the balance
//! mutation. Once that transaction commits the intent is dispatched to the
//! work queue. Intents whose dispatch failed (queue down, process crash
//! between commit and dispatch) are picked up by the background sweeper.

use std::sync::Arc;
use std::time::Duration;

use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::{QueueClass, SendSmsPayload};
use jonche_notifier::enqueuer::{EnqueueOptions, TaskEnqueuer};

/// Intents the sweeper handles per pass.
const SWEEP_BATCH: i64 = 100;

/// Dispatch attempts after which an intent is abandoned and its
/// notifications are marked failed.
pub const MAX_DISPATCH_ATTEMPTS: i32 = 20;

/// Upper bound on the wait between two dispatch attempts of one intent.
const MAX_BACKOFF_SECS: i64 = 300;

/// Wait before the next sweep may retry an intent that failed `attempts` times.
fn dispatch_backoff(attempts: i32) -> i64 {
    let exp = attempts.clamp(0, 16) as u32;
    (1_i64 << exp).min(MAX_BACKOFF_SECS)
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    queue: QueueClass,
    max_retry: i32,
    payload: Json<SendSmsPayload>,
    attempts: i32,
}

impl OutboxRow {
    fn options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.queue,
            max_retry: self.max_retry.max(0) as u32,
        }
    }
}

/// Write an enqueue intent inside the caller's transaction.
pub async fn record_intent(
    conn: &mut PgConnection,
    payload: &SendSmsPayload,
    options: EnqueueOptions,
) -> Result<Uuid, AppError> {
    payload.validate()?;

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO notification_outbox (id, queue, max_retry, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(id)
    .bind(options.queue)
    .bind(options.max_retry as i32)
    .bind(Json(payload))
    .execute(conn)
    .await?;

    Ok(id)
}

/// Moves committed intents onto the work queue.
pub struct OutboxDispatcher {
    pool: PgPool,
    enqueuer: TaskEnqueuer,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, enqueuer: TaskEnqueuer) -> Self {
        Self { pool, enqueuer }
    }

    /// Dispatch one intent.
    ///
    /// Returns `false` when the intent is already dispatched, abandoned, or
    /// held by another dispatcher.
    pub async fn dispatch(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<OutboxRow> = sqlx::query_as(
            r#"
            SELECT id, queue, max_retry, payload, attempts
            FROM notification_outbox
            WHERE id = $1 AND dispatched_at IS NULL AND attempts < $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(id)
        .bind(MAX_DISPATCH_ATTEMPTS)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        match self
            .enqueuer
            .enqueue(row.payload.0.clone(), row.options())
            .await
        {
            Ok(task_id) => {
                sqlx::query(
                    "UPDATE notification_outbox SET dispatched_at = NOW(), last_error = NULL WHERE id = $1",
                )
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                tracing::info!(
                    outbox_id = %row.id,
                    task_id = %task_id,
                    queue = %row.queue,
                    "Outbox intent dispatched"
                );
                Ok(true)
            }
            Err(e) => {
                let err = AppError::from(e);
                let attempts = row.attempts + 1;
                sqlx::query(
                    r#"
                    UPDATE notification_outbox
                    SET attempts = $2, last_error = $3,
                        next_attempt_at = NOW() + make_interval(secs => $4)
                    WHERE id = $1
                    "#,
                )
                .bind(row.id)
                .bind(attempts)
                .bind(err.to_string())
                .bind(dispatch_backoff(attempts) as f64)
                .execute(&mut *tx)
                .await?;

                if attempts >= MAX_DISPATCH_ATTEMPTS {
                    let abandoned = sqlx::query(
                        r#"
                        UPDATE notifications
                        SET status = 'failed', error_detail = $2, updated_at = NOW()
                        WHERE correlation_id = ANY($1) AND status NOT IN ('delivered', 'failed')
                        "#,
                    )
                    .bind(row.payload.0.ref_ids.clone())
                    .bind(format!(
                        "not queued after {} dispatch attempts: {}",
                        attempts, err
                    ))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    tx.commit().await?;

                    tracing::error!(
                        outbox_id = %row.id,
                        attempts,
                        notifications_failed = abandoned,
                        error = %err,
                        "Outbox intent abandoned after repeated dispatch failures"
                    );
                } else {
                    tx.commit().await?;
                }
                Err(err)
            }
        }
    }

    /// Dispatch every undispatched intent that is within its attempt budget
    /// and past its backoff.
    pub async fn sweep(&self) -> Result<usize, AppError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM notification_outbox
            WHERE dispatched_at IS NULL AND attempts < $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(MAX_DISPATCH_ATTEMPTS)
        .bind(SWEEP_BATCH)
        .fetch_all(&self.pool)
        .await?;

        let mut dispatched = 0;
        for id in ids {
            match self.dispatch(id).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    // The queue is likely down; the rest would fail the same way.
                    tracing::warn!(outbox_id = %id, error = %e, "Outbox sweep interrupted");
                    break;
                }
                Err(e) => tracing::warn!(outbox_id = %id, error = %e, "Outbox dispatch failed"),
            }
        }

        if dispatched > 0 {
            tracing::info!(dispatched, "Outbox sweep dispatched stranded intents");
        }
        Ok(dispatched)
    }
}

/// Handle to stop a running sweeper.
pub struct SweeperHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for its current pass to finish.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Outbox sweeper task failed");
        }
    }
}

/// Spawn a background task that sweeps the outbox every `interval`.
pub fn spawn_sweeper(dispatcher: Arc<OutboxDispatcher>, interval: Duration) -> SweeperHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Outbox sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = dispatcher.sweep().await {
                        tracing::error!(error = %e, "Outbox sweep failed");
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        tracing::info!("Outbox sweeper stopped");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        cancel: cancel_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_backoff_doubles_then_caps() {
        assert_eq!(dispatch_backoff(1), 2);
        assert_eq!(dispatch_backoff(4), 16);
        assert_eq!(dispatch_backoff(8), MAX_BACKOFF_SECS);
        assert_eq!(dispatch_backoff(MAX_DISPATCH_ATTEMPTS), MAX_BACKOFF_SECS);
    }

    #[test]
    fn test_row_options_clamp_negative_budget() {
        let row = OutboxRow {
            id: Uuid::new_v4(),
            queue: QueueClass::Critical,
            max_retry: -1,
            payload: Json(SendSmsPayload {
                phone_numbers: vec!["0712345678".into()],
                messages: vec!["hi".into()],
                ref_ids: vec![Uuid::new_v4()],
            }),
            attempts: 0,
        };
        assert_eq!(
            row.options(),
            EnqueueOptions {
                queue: QueueClass::Critical,
                max_retry: 0,
            }
        );
    }
}
