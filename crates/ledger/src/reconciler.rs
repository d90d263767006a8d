//! Delivery-status callbacks from the SMS provider.

use sqlx::PgPool;
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::DeliveryStatus;

/// Provider statuses meaning the handset received the message.
const DELIVERED_STATUSES: &[&str] = &["DeliveredToTerminal", "DELIVRD"];

/// Provider statuses meaning the message will never arrive.
const FAILED_STATUSES: &[&str] = &["DeliveryImpossible", "UNDELIV", "REJECTD", "EXPIRED"];

/// A parsed delivery-status notice.
#[derive(Debug, Clone)]
pub struct DeliveryNotice {
    pub correlation_id: Uuid,
    pub provider_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The notification was updated.
    Applied,
    /// The notification already has a terminal status; nothing changed.
    AlreadyTerminal,
    /// No notification carries this correlation id.
    UnknownCorrelation,
}

/// Map a provider status string to the terminal status it implies, if any.
pub fn classify_status(provider_status: &str) -> Option<DeliveryStatus> {
    let status = provider_status.trim();
    if DELIVERED_STATUSES.iter().any(|s| s.eq_ignore_ascii_case(status)) {
        Some(DeliveryStatus::Delivered)
    } else if FAILED_STATUSES.iter().any(|s| s.eq_ignore_ascii_case(status)) {
        Some(DeliveryStatus::Failed)
    } else {
        None
    }
}

/// Applies delivery notices to notifications.
#[derive(Clone)]
pub struct DeliveryReconciler {
    pool: PgPool,
}

impl DeliveryReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a notice. Safe to call any number of times with the same notice.
    pub async fn apply(&self, notice: &DeliveryNotice) -> Result<ReconcileOutcome, AppError> {
        let terminal = classify_status(&notice.provider_status);

        // Non-terminal statuses only refresh callback_status.
        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE notifications
            SET callback_status = $2,
                status = COALESCE($3, status),
                updated_at = NOW()
            WHERE correlation_id = $1 AND status NOT IN ('delivered', 'failed')
            RETURNING correlation_id
            "#,
        )
        .bind(notice.correlation_id)
        .bind(&notice.provider_status)
        .bind(terminal)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_some() {
            tracing::info!(
                correlation_id = %notice.correlation_id,
                provider_status = %notice.provider_status,
                status = ?terminal,
                "Delivery status reconciled"
            );
            return Ok(ReconcileOutcome::Applied);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM notifications WHERE correlation_id = $1)",
        )
        .bind(notice.correlation_id)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            tracing::debug!(
                correlation_id = %notice.correlation_id,
                provider_status = %notice.provider_status,
                "Delivery notice ignored, status already terminal"
            );
            Ok(ReconcileOutcome::AlreadyTerminal)
        } else {
            tracing::warn!(
                correlation_id = %notice.correlation_id,
                "Delivery notice for unknown correlation id"
            );
            Ok(ReconcileOutcome::UnknownCorrelation)
        }
    }
}
