//! HTTP surface of the payment ledger.
//!
//! - `POST /api/callbacks/payments`: mobile-money payment notices
//! - `POST /api/callbacks/sms`: SMS delivery reports
//! - `POST /api/payments`, `GET /api/payments/{id}`,
//!   `POST /api/payments/{id}/assign`: operator payment entry and assignment
//! - `POST /api/sms`: operator bulk SMS
//! - `GET /health`

pub mod routes;
pub mod state;
