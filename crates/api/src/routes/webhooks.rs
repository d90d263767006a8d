//! Provider callbacks.
//!
//! Both providers treat any non-2xx answer as a transport failure and retry
//! forever, so these handlers always answer 200 and report the outcome in the
//! acknowledgment body instead.

use std::str::FromStr;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::PaymentSource;
use jonche_ledger::coordinator::{NewPayment, RecordOutcome};
use jonche_ledger::matcher::MatchOutcome;
use jonche_ledger::reconciler::{DeliveryNotice, ReconcileOutcome};

use crate::state::AppState;

/// `TransTime` layout, in East Africa Time.
const TRANS_TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const EAT_OFFSET_SECS: i32 = 3 * 3600;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/callbacks/payments", post(payment_callback))
        .route("/api/callbacks/sms", post(delivery_callback))
}

/// Provider acknowledgment body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: u16,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

impl CallbackAck {
    pub const ACCEPTED: CallbackAck = CallbackAck {
        result_code: 200,
        result_desc: "Accepted",
    };

    pub const REJECTED: CallbackAck = CallbackAck {
        result_code: 400,
        result_desc: "Rejected",
    };
}

/// Mobile-money confirmation notice.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotice {
    #[serde(rename = "TransID")]
    pub trans_id: String,
    /// Amount as a decimal string, e.g. `"1500.00"`.
    #[serde(rename = "TransAmount")]
    pub trans_amount: String,
    #[serde(rename = "FirstName")]
    pub first_name: String,
    /// `YYYYMMDDHHMMSS` in East Africa Time.
    #[serde(rename = "TransTime", default)]
    pub trans_time: Option<String>,
}

impl PaymentNotice {
    /// Check the notice and turn it into an unassigned payment.
    pub fn into_payment(self, received_at: DateTime<Utc>) -> Result<NewPayment, String> {
        let transaction_number = self.trans_id.trim().to_string();
        if transaction_number.is_empty() {
            return Err("TransID is empty".into());
        }
        if self.first_name.trim().is_empty() {
            return Err("FirstName is empty".into());
        }

        let amount = Decimal::from_str(self.trans_amount.trim())
            .map_err(|e| format!("TransAmount '{}' is not a number: {}", self.trans_amount, e))?;
        if amount <= Decimal::ZERO {
            return Err(format!("TransAmount '{}' is not positive", self.trans_amount));
        }

        let paid_at = match self.trans_time.as_deref().map(str::trim) {
            None | Some("") => received_at,
            Some(raw) => parse_trans_time(raw)?,
        };

        Ok(NewPayment {
            transaction_number,
            source: PaymentSource::MobileMoney,
            paying_name: self.first_name,
            amount,
            paid_at,
            assign_to: None,
        })
    }
}

fn parse_trans_time(raw: &str) -> Result<DateTime<Utc>, String> {
    let naive = NaiveDateTime::parse_from_str(raw, TRANS_TIME_FORMAT)
        .map_err(|e| format!("TransTime '{}' is invalid: {}", raw, e))?;
    let offset = FixedOffset::east_opt(EAT_OFFSET_SECS)
        .ok_or_else(|| "invalid East Africa Time offset".to_string())?;
    naive
        .and_local_timezone(offset)
        .single()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("TransTime '{}' is ambiguous", raw))
}

/// SMS delivery report.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryReport {
    #[serde(rename = "refId")]
    pub ref_id: String,
    pub status: String,
}

impl DeliveryReport {
    pub fn into_notice(self) -> Result<DeliveryNotice, String> {
        let correlation_id = Uuid::parse_str(self.ref_id.trim())
            .map_err(|e| format!("refId '{}' is not a UUID: {}", self.ref_id, e))?;
        if self.status.trim().is_empty() {
            return Err("status is empty".into());
        }
        Ok(DeliveryNotice {
            correlation_id,
            provider_status: self.status.trim().to_string(),
        })
    }
}

/// POST /api/callbacks/payments: record a payment and settle it if the payer is known.
async fn payment_callback(
    State(state): State<AppState>,
    payload: Result<Json<PaymentNotice>, JsonRejection>,
) -> Json<CallbackAck> {
    let notice = match payload {
        Ok(Json(notice)) => notice,
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "Malformed payment notice");
            return Json(CallbackAck::REJECTED);
        }
    };

    let payer = notice.first_name.clone();
    let mut payment = match notice.into_payment(Utc::now()) {
        Ok(payment) => payment,
        Err(reason) => {
            tracing::warn!(reason = %reason, "Invalid payment notice");
            return Json(CallbackAck::REJECTED);
        }
    };

    payment.assign_to = match state.matcher.resolve(&payer).await {
        Ok(MatchOutcome::Matched(customer_id)) => Some(customer_id),
        Ok(MatchOutcome::Unmatched) => None,
        Ok(MatchOutcome::Ambiguous(candidates)) => {
            tracing::warn!(
                transaction_number = %payment.transaction_number,
                payer = %payer,
                candidates,
                "Payer name matches several customers, leaving payment unassigned"
            );
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Payer lookup failed");
            return Json(CallbackAck::REJECTED);
        }
    };

    let result = match state.coordinator.record_payment(payment.clone()).await {
        // The payment itself is valid; keep it for manual assignment.
        Err(e @ (AppError::Conflict(_) | AppError::NotFound(_))) if payment.assign_to.is_some() => {
            tracing::warn!(
                transaction_number = %payment.transaction_number,
                error = %e,
                "Automatic assignment failed, recording payment unassigned"
            );
            payment.assign_to = None;
            state.coordinator.record_payment(payment).await
        }
        other => other,
    };

    match result {
        Ok(RecordOutcome::Recorded(receipt)) => {
            tracing::info!(
                payment_id = receipt.payment.id,
                assigned = receipt.payment.assigned,
                "Payment notice accepted"
            );
            Json(CallbackAck::ACCEPTED)
        }
        Ok(RecordOutcome::Duplicate { .. }) => Json(CallbackAck::ACCEPTED),
        Err(e) => {
            tracing::error!(error = %e, "Failed to record payment notice");
            Json(CallbackAck::REJECTED)
        }
    }
}

/// POST /api/callbacks/sms: apply a delivery report.
async fn delivery_callback(
    State(state): State<AppState>,
    payload: Result<Json<DeliveryReport>, JsonRejection>,
) -> Json<CallbackAck> {
    let notice = match payload {
        Ok(Json(report)) => match report.into_notice() {
            Ok(notice) => notice,
            Err(reason) => {
                tracing::warn!(reason = %reason, "Invalid delivery report");
                return Json(CallbackAck::REJECTED);
            }
        },
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "Malformed delivery report");
            return Json(CallbackAck::REJECTED);
        }
    };

    match state.reconciler.apply(&notice).await {
        Ok(ReconcileOutcome::Applied)
        | Ok(ReconcileOutcome::AlreadyTerminal)
        | Ok(ReconcileOutcome::UnknownCorrelation) => Json(CallbackAck::ACCEPTED),
        Err(e) => {
            tracing::error!(
                correlation_id = %notice.correlation_id,
                error = %e,
                "Failed to reconcile delivery report"
            );
            Json(CallbackAck::REJECTED)
        }
    }
}
