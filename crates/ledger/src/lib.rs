//! Payment ledger.
//!
//! Applies payments to customer balances and records the confirmation SMS in
//! the same transaction, then hands the SMS to the notifier through a
//! transactional outbox. Also reconciles the provider's delivery callbacks.

pub mod coordinator;
pub mod matcher;
pub mod outbox;
pub mod reconciler;
pub mod renderer;
