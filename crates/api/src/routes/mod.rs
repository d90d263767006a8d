pub mod health;
pub mod payments;
pub mod sms;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(webhooks::router())
        .merge(payments::router())
        .merge(sms::router())
        .with_state(state)
}
