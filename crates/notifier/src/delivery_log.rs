//! Write-back of delivery attempts against notifications.
//!
//! Every write is keyed by correlation id and guarded on a non-terminal
//! status, so replays and late writes never overwrite `delivered`/`failed`.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::DeliveryStatus;

use crate::gateway::GatewayReceipt;

/// Result of one worker attempt for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAttempt {
    /// The gateway took the message.
    Accepted(GatewayReceipt),
    /// The gateway refused it for good.
    Rejected { reason: String },
    /// Transient failures used up the retry budget.
    Exhausted { reason: String },
}

impl DeliveryAttempt {
    pub fn resulting_status(&self) -> DeliveryStatus {
        match self {
            DeliveryAttempt::Accepted(_) => DeliveryStatus::Sent,
            DeliveryAttempt::Rejected { .. } | DeliveryAttempt::Exhausted { .. } => {
                DeliveryStatus::Failed
            }
        }
    }
}

#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Current status, or `None` for an unknown correlation id.
    async fn status(&self, correlation_id: Uuid) -> Result<Option<DeliveryStatus>, AppError>;

    /// Record an attempt. Returns `false` when the notification is unknown or
    /// already terminal and nothing was written.
    async fn record(&self, correlation_id: Uuid, attempt: &DeliveryAttempt)
    -> Result<bool, AppError>;
}

/// Postgres-backed delivery log over the `notifications` table.
#[derive(Clone)]
pub struct PgDeliveryLog {
    pool: PgPool,
}

impl PgDeliveryLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLog for PgDeliveryLog {
    async fn status(&self, correlation_id: Uuid) -> Result<Option<DeliveryStatus>, AppError> {
        let status: Option<DeliveryStatus> =
            sqlx::query_scalar("SELECT status FROM notifications WHERE correlation_id = $1")
                .bind(correlation_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    async fn record(
        &self,
        correlation_id: Uuid,
        attempt: &DeliveryAttempt,
    ) -> Result<bool, AppError> {
        let result = match attempt {
            DeliveryAttempt::Accepted(receipt) => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET status = $2, cost = $3, description = $4, provider_message_id = $5,
                        error_detail = NULL, updated_at = NOW()
                    WHERE correlation_id = $1 AND status IN ('pending', 'sent')
                    "#,
                )
                .bind(correlation_id)
                .bind(DeliveryStatus::Sent.to_string())
                .bind(&receipt.cost)
                .bind(&receipt.description)
                .bind(&receipt.provider_message_id)
                .execute(&self.pool)
                .await?
            }
            DeliveryAttempt::Rejected { reason } | DeliveryAttempt::Exhausted { reason } => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET status = $2, error_detail = $3, updated_at = NOW()
                    WHERE correlation_id = $1 AND status IN ('pending', 'sent')
                    "#,
                )
                .bind(correlation_id)
                .bind(DeliveryStatus::Failed.to_string())
                .bind(reason)
                .execute(&self.pool)
                .await?
            }
        };

        let written = result.rows_affected() == 1;
        if written {
            tracing::info!(
                correlation_id = %correlation_id,
                status = %attempt.resulting_status(),
                "Delivery attempt recorded"
            );
        } else {
            tracing::debug!(
                correlation_id = %correlation_id,
                "Delivery attempt ignored, notification unknown or already terminal"
            );
        }
        Ok(written)
    }
}
