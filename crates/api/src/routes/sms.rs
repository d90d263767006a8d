//! Operator bulk SMS.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jonche_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/sms", post(send_sms))
}

#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    pub customer_ids: Vec<i64>,
    /// Template over `Name`, `PhoneNumber` and `Loaned`.
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SendSmsResponse {
    pub outbox_id: Uuid,
    pub correlation_ids: Vec<Uuid>,
}

/// POST /api/sms: queue one rendered message per customer.
async fn send_sms(
    State(state): State<AppState>,
    Json(req): Json<SendSmsRequest>,
) -> Result<(StatusCode, Json<SendSmsResponse>), AppError> {
    let batch = state
        .coordinator
        .send_manual(&req.customer_ids, &req.message)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SendSmsResponse {
            outbox_id: batch.outbox_id,
            correlation_ids: batch.correlation_ids,
        }),
    ))
}
