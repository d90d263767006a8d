//! Operator payment routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jonche_common::error::AppError;
use jonche_common::types::{Payment, PaymentSource};
use jonche_ledger::coordinator::{LedgerReceipt, NewPayment, RecordOutcome};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/payments", post(create_payment))
        .route("/api/payments/{id}", get(get_payment))
        .route("/api/payments/{id}/assign", post(assign_payment))
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub transaction_number: String,
    #[serde(default = "default_source")]
    pub transaction_source: PaymentSource,
    pub paying_name: String,
    pub amount: Decimal,
    pub assigned_to: i64,
    pub paid_at: Option<DateTime<Utc>>,
}

fn default_source() -> PaymentSource {
    PaymentSource::Manual
}

#[derive(Debug, Deserialize)]
pub struct AssignQuery {
    #[serde(rename = "customerId")]
    pub customer_id: i64,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub payment: Payment,
    pub balance: Option<Decimal>,
    pub correlation_id: Option<Uuid>,
}

impl From<LedgerReceipt> for PaymentResponse {
    fn from(receipt: LedgerReceipt) -> Self {
        Self {
            payment: receipt.payment,
            balance: receipt.balance,
            correlation_id: receipt.correlation_id,
        }
    }
}

/// POST /api/payments: record a payment already attributed to a customer.
async fn create_payment(
    State(state): State<AppState>,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), AppError> {
    let outcome = state
        .coordinator
        .record_payment(NewPayment {
            transaction_number: req.transaction_number,
            source: req.transaction_source,
            paying_name: req.paying_name,
            amount: req.amount,
            paid_at: req.paid_at.unwrap_or_else(Utc::now),
            assign_to: Some(req.assigned_to),
        })
        .await?;

    match outcome {
        RecordOutcome::Recorded(receipt) => Ok((StatusCode::CREATED, Json(receipt.into()))),
        RecordOutcome::Duplicate { payment_id } => Err(AppError::Conflict(format!(
            "transaction number already recorded as payment {}",
            payment_id
        ))),
    }
}

/// GET /api/payments/{id}
async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Payment>, AppError> {
    Ok(Json(state.coordinator.payment(id).await?))
}

/// POST /api/payments/{id}/assign?customerId=: settle an unassigned payment.
async fn assign_payment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<AssignQuery>,
) -> Result<Json<PaymentResponse>, AppError> {
    let receipt = state
        .coordinator
        .assign_payment(id, query.customer_id)
        .await?;
    Ok(Json(receipt.into()))
}
