use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Where a payment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentSource {
    MobileMoney,
    Manual,
}

impl std::fmt::Display for PaymentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentSource::MobileMoney => write!(f, "mobile_money"),
            PaymentSource::Manual => write!(f, "manual"),
        }
    }
}

/// Notification delivery status.
///
/// Moves `pending -> sent -> {delivered | failed}`. `pending` may also go
/// straight to a terminal status when the gateway rejects the message or
/// the delivery callback arrives before the worker's write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Terminal statuses are never overwritten.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Whether a notification was produced by the ledger or by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Automated,
    Manual,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Automated => write!(f, "automated"),
            NotificationType::Manual => write!(f, "manual"),
        }
    }
}

/// Priority lane of the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Critical,
    Default,
    Low,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Critical, QueueClass::Default, QueueClass::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
            QueueClass::Low => "low",
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A borrower.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    /// Outstanding balance. Only the ledger coordinator changes it.
    pub loaned: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A received payment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub transaction_number: String,
    pub transaction_source: PaymentSource,
    pub paying_name: String,
    pub amount: Decimal,
    pub assigned: bool,
    pub assigned_to: Option<i64>,
    pub paid_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A text message owed to a customer, joined to later callbacks by `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub correlation_id: Uuid,
    pub customer_id: i64,
    pub message: String,
    pub notification_type: NotificationType,
    pub status: DeliveryStatus,
    pub cost: Option<String>,
    pub description: Option<String>,
    pub provider_message_id: Option<String>,
    pub callback_status: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch of text messages handed to the work queue.
///
/// The three sequences are parallel: entry `i` of each belongs to the same
/// message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSmsPayload {
    pub phone_numbers: Vec<String>,
    pub messages: Vec<String>,
    pub ref_ids: Vec<Uuid>,
}

impl SendSmsPayload {
    /// Reject empty batches and batches whose sequences differ in length.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.messages.is_empty() {
            return Err(AppError::Validation("payload has no messages".to_string()));
        }
        if self.messages.len() != self.phone_numbers.len()
            || self.messages.len() != self.ref_ids.len()
        {
            return Err(AppError::Validation(format!(
                "messages ({}), phone_numbers ({}) and ref_ids ({}) must be the same length",
                self.messages.len(),
                self.phone_numbers.len(),
                self.ref_ids.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Iterate `(message, phone_number, ref_id)` triples.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, Uuid)> {
        self.messages
            .iter()
            .zip(self.phone_numbers.iter())
            .zip(self.ref_ids.iter())
            .map(|((m, p), r)| (m.as_str(), p.as_str(), *r))
    }

    /// Build a payload holding only the entries at `indices`.
    pub fn subset(&self, indices: &[usize]) -> SendSmsPayload {
        SendSmsPayload {
            phone_numbers: indices.iter().map(|&i| self.phone_numbers[i].clone()).collect(),
            messages: indices.iter().map(|&i| self.messages[i].clone()).collect(),
            ref_ids: indices.iter().map(|&i| self.ref_ids[i]).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(messages: usize, phones: usize, refs: usize) -> SendSmsPayload {
        SendSmsPayload {
            phone_numbers: (0..phones).map(|i| format!("07000000{:02}", i)).collect(),
            messages: (0..messages).map(|i| format!("message {}", i)).collect(),
            ref_ids: (0..refs).map(|_| Uuid::new_v4()).collect(),
        }
    }

    #[test]
    fn test_validate_accepts_equal_lengths() {
        assert!(payload(3, 3, 3).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_lengths() {
        assert!(payload(2, 1, 2).validate().is_err());
        assert!(payload(2, 2, 1).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(payload(0, 0, 0).validate().is_err());
    }

    #[test]
    fn test_wire_format() {
        let p = payload(1, 1, 1);
        let json = serde_json::to_value(&p).unwrap();
        assert!(json["phone_numbers"].is_array());
        assert!(json["messages"].is_array());
        assert_eq!(json["ref_ids"][0], p.ref_ids[0].to_string());
    }

    #[test]
    fn test_subset_keeps_entries_aligned() {
        let p = payload(3, 3, 3);
        let sub = p.subset(&[2, 0]);
        assert_eq!(sub.messages, vec!["message 2", "message 0"]);
        assert_eq!(sub.ref_ids, vec![p.ref_ids[2], p.ref_ids[0]]);
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Sent.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }
}
