//! Shared application state for the Axum API server.

use std::sync::Arc;

use sqlx::PgPool;

use jonche_ledger::coordinator::LedgerCoordinator;
use jonche_ledger::matcher::PaymentMatcher;
use jonche_ledger::reconciler::DeliveryReconciler;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub coordinator: Arc<LedgerCoordinator>,
    pub matcher: PaymentMatcher,
    pub reconciler: DeliveryReconciler,
}

impl AppState {
    pub fn new(pool: PgPool, coordinator: Arc<LedgerCoordinator>) -> Self {
        Self {
            matcher: PaymentMatcher::new(pool.clone()),
            reconciler: DeliveryReconciler::new(pool.clone()),
            coordinator,
            pool,
        }
    }
}
