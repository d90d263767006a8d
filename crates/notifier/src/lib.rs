//! SMS notification delivery.
//!
//! Producers hand batches to [`enqueuer::TaskEnqueuer`], which validates them
//! and pushes them onto a priority lane of the durable queue. The
//! [`worker::WorkerPool`] drains the lanes, calls the SMS gateway once per
//! message and writes the gateway's answer back against the notification's
//! correlation id.

pub mod delivery_log;
pub mod enqueuer;
pub mod gateway;
pub mod memory;
pub mod phone;
pub mod queue;
pub mod worker;
