//! Ledger transaction coordinator.
//!
//! Every balance mutation runs in one Postgres transaction together with the
//! payment assignment, the rendered notification and its outbox intent. The
//! intent is only dispatched to the work queue after that transaction has
//! committed.
//!
//! Lock order is customer row first, payment row second, on every path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use jonche_common::config::OverpaymentPolicy;
use jonche_common::error::AppError;
use jonche_common::types::{Customer, NotificationType, Payment, PaymentSource, SendSmsPayload};
use jonche_notifier::enqueuer::EnqueueOptions;

use crate::matcher::normalize_name;
use crate::outbox::{OutboxDispatcher, record_intent};
use crate::renderer::{MessageTemplate, RenderError, TemplateParams};

const PAYMENT_COLUMNS: &str = "id, transaction_number, transaction_source, paying_name, amount, \
     assigned, assigned_to, paid_at, created_at";

const CUSTOMER_COLUMNS: &str = "id, name, phone_number, loaned, active, created_at";

/// A payment to record.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub transaction_number: String,
    pub source: PaymentSource,
    pub paying_name: String,
    pub amount: Decimal,
    pub paid_at: DateTime<Utc>,
    /// Customer to settle against right away, if already known.
    pub assign_to: Option<i64>,
}

/// What a committed ledger mutation produced.
#[derive(Debug, Clone)]
pub struct LedgerReceipt {
    pub payment: Payment,
    /// Balance after the payment, when it was assigned.
    pub balance: Option<Decimal>,
    /// Correlation id of the confirmation SMS, when one was created.
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Recorded(LedgerReceipt),
    /// The transaction number was already on file; nothing changed.
    Duplicate { payment_id: i64 },
}

/// Result of a bulk manual send.
#[derive(Debug, Clone)]
pub struct ManualBatch {
    pub outbox_id: Uuid,
    pub correlation_ids: Vec<Uuid>,
}

/// New loaned balance after applying `amount`.
pub fn reduce_balance(
    loaned: Decimal,
    amount: Decimal,
    policy: OverpaymentPolicy,
) -> Result<Decimal, AppError> {
    if amount <= loaned {
        return Ok(loaned - amount);
    }
    match policy {
        OverpaymentPolicy::Clamp => Ok(Decimal::ZERO),
        OverpaymentPolicy::Reject => Err(AppError::Conflict(format!(
            "payment of {} exceeds outstanding balance of {}",
            amount, loaned
        ))),
    }
}

pub struct LedgerCoordinator {
    pool: PgPool,
    dispatcher: Arc<OutboxDispatcher>,
    policy: OverpaymentPolicy,
    template: MessageTemplate,
}

impl LedgerCoordinator {
    /// Build a coordinator. Fails if the confirmation template is invalid.
    pub fn new(
        pool: PgPool,
        dispatcher: Arc<OutboxDispatcher>,
        policy: OverpaymentPolicy,
        payment_template: &str,
    ) -> Result<Self, RenderError> {
        Ok(Self {
            pool,
            dispatcher,
            policy,
            template: MessageTemplate::parse(payment_template)?,
        })
    }

    /// Record a payment, settling it against `assign_to` in the same
    /// transaction when given.
    pub async fn record_payment(&self, new: NewPayment) -> Result<RecordOutcome, AppError> {
        if new.transaction_number.trim().is_empty() {
            return Err(AppError::Validation("transaction number is required".into()));
        }
        if new.amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "payment amount must be positive, got {}",
                new.amount
            )));
        }

        let mut tx = self.pool.begin().await?;

        let inserted: Option<Payment> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments (transaction_number, transaction_source, paying_name, amount, paid_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (transaction_number) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(new.transaction_number.trim())
        .bind(new.source)
        .bind(normalize_name(&new.paying_name))
        .bind(new.amount)
        .bind(new.paid_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payment) = inserted else {
            tx.rollback().await?;
            let payment_id: i64 =
                sqlx::query_scalar("SELECT id FROM payments WHERE transaction_number = $1")
                    .bind(new.transaction_number.trim())
                    .fetch_one(&self.pool)
                    .await?;
            tracing::info!(
                transaction_number = %new.transaction_number,
                payment_id,
                "Duplicate payment notice ignored"
            );
            return Ok(RecordOutcome::Duplicate { payment_id });
        };

        tracing::info!(
            payment_id = payment.id,
            transaction_number = %payment.transaction_number,
            source = %payment.transaction_source,
            amount = %payment.amount,
            "Payment recorded"
        );

        let Some(customer_id) = new.assign_to else {
            tx.commit().await?;
            return Ok(RecordOutcome::Recorded(LedgerReceipt {
                payment,
                balance: None,
                correlation_id: None,
            }));
        };

        let settled = self.settle(&mut *tx, payment.id, customer_id).await?;
        tx.commit().await?;
        self.dispatch_after_commit(settled.outbox_id).await;

        Ok(RecordOutcome::Recorded(settled.receipt))
    }

    /// Assign an unassigned payment to a customer and settle it.
    pub async fn assign_payment(
        &self,
        payment_id: i64,
        customer_id: i64,
    ) -> Result<LedgerReceipt, AppError> {
        let mut tx = self.pool.begin().await?;
        let settled = self.settle(&mut *tx, payment_id, customer_id).await?;
        tx.commit().await?;
        self.dispatch_after_commit(settled.outbox_id).await;

        Ok(settled.receipt)
    }

    pub async fn payment(&self, payment_id: i64) -> Result<Payment, AppError> {
        sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("payment {} not found", payment_id)))
    }

    /// Render `template` for every customer and queue one manual SMS batch.
    ///
    /// Unknown customers abort the whole batch.
    pub async fn send_manual(
        &self,
        customer_ids: &[i64],
        template: &str,
    ) -> Result<ManualBatch, AppError> {
        let mut ids: Vec<i64> = Vec::with_capacity(customer_ids.len());
        for id in customer_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        if ids.is_empty() {
            return Err(AppError::Validation("no customers selected".into()));
        }

        let template = MessageTemplate::parse(template)?;
        if template.needs_payment() {
            return Err(AppError::Validation(
                "manual messages cannot reference payment fields".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let customers: Vec<Customer> = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ANY($1)"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !customers.iter().any(|c| c.id == **id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::NotFound(format!(
                "customers not found: {}",
                missing.join(", ")
            )));
        }

        let mut payload = SendSmsPayload::default();
        for id in &ids {
            let Some(customer) = customers.iter().find(|c| c.id == *id) else {
                continue;
            };
            let message = template.render(&TemplateParams {
                name: customer.name.clone(),
                phone_number: customer.phone_number.clone(),
                loaned: customer.loaned,
                ..TemplateParams::default()
            })?;
            let correlation_id =
                insert_notification(&mut *tx, customer.id, &message, NotificationType::Manual)
                    .await?;

            payload.messages.push(message);
            payload.phone_numbers.push(customer.phone_number.clone());
            payload.ref_ids.push(correlation_id);
        }

        let outbox_id = record_intent(&mut *tx, &payload, EnqueueOptions::bulk_manual()).await?;
        tx.commit().await?;

        tracing::info!(
            outbox_id = %outbox_id,
            recipients = payload.len(),
            "Manual SMS batch recorded"
        );
        self.dispatch_after_commit(outbox_id).await;

        Ok(ManualBatch {
            outbox_id,
            correlation_ids: payload.ref_ids,
        })
    }

    /// Assign, reduce the balance, create the confirmation and its intent.
    async fn settle(
        &self,
        conn: &mut PgConnection,
        payment_id: i64,
        customer_id: i64,
    ) -> Result<Settled, AppError> {
        let customer: Customer = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1 FOR UPDATE"
        ))
        .bind(customer_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("customer {} not found", customer_id)))?;

        // Re-checked under the row lock; a concurrent assigner sees zero rows.
        let payment: Option<Payment> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET assigned = TRUE, assigned_to = $2
            WHERE id = $1 AND assigned = FALSE
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(customer_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(payment) = payment else {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payments WHERE id = $1)")
                    .bind(payment_id)
                    .fetch_one(&mut *conn)
                    .await?;
            return Err(if exists {
                AppError::Conflict(format!("payment {} is already assigned", payment_id))
            } else {
                AppError::NotFound(format!("payment {} not found", payment_id))
            });
        };

        let balance = reduce_balance(customer.loaned, payment.amount, self.policy)?;
        sqlx::query("UPDATE customers SET loaned = $2 WHERE id = $1")
            .bind(customer.id)
            .bind(balance)
            .execute(&mut *conn)
            .await?;

        let message = self.template.render(&TemplateParams {
            name: customer.name.clone(),
            phone_number: customer.phone_number.clone(),
            loaned: balance,
            paid: Some(payment.amount),
            paid_date: Some(payment.paid_at),
        })?;

        let correlation_id =
            insert_notification(conn, customer.id, &message, NotificationType::Automated).await?;

        let payload = SendSmsPayload {
            phone_numbers: vec![customer.phone_number.clone()],
            messages: vec![message],
            ref_ids: vec![correlation_id],
        };
        let outbox_id =
            record_intent(conn, &payload, EnqueueOptions::payment_confirmation()).await?;

        tracing::info!(
            payment_id = payment.id,
            customer_id = customer.id,
            amount = %payment.amount,
            previous_balance = %customer.loaned,
            balance = %balance,
            correlation_id = %correlation_id,
            "Payment assigned"
        );

        Ok(Settled {
            receipt: LedgerReceipt {
                payment,
                balance: Some(balance),
                correlation_id: Some(correlation_id),
            },
            outbox_id,
        })
    }

    async fn dispatch_after_commit(&self, outbox_id: Uuid) {
        if let Err(e) = self.dispatcher.dispatch(outbox_id).await {
            tracing::warn!(
                outbox_id = %outbox_id,
                error = %e,
                "Dispatch after commit failed, left for the outbox sweeper"
            );
        }
    }
}

struct Settled {
    receipt: LedgerReceipt,
    outbox_id: Uuid,
}

/// Insert a pending notification with a fresh correlation id.
async fn insert_notification(
    conn: &mut PgConnection,
    customer_id: i64,
    message: &str,
    kind: NotificationType,
) -> Result<Uuid, AppError> {
    let correlation_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO notifications (correlation_id, customer_id, message, notification_type)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(correlation_id)
    .bind(customer_id)
    .bind(message)
    .bind(kind)
    .execute(conn)
    .await?;

    tracing::debug!(
        correlation_id = %correlation_id,
        customer_id,
        kind = %kind,
        "Notification persisted"
    );
    Ok(correlation_id)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_reduce_balance_within_outstanding() {
        assert_eq!(
            reduce_balance(dec!(1000), dec!(250.50), OverpaymentPolicy::Clamp).unwrap(),
            dec!(749.50)
        );
        assert_eq!(
            reduce_balance(dec!(300), dec!(300), OverpaymentPolicy::Reject).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_overpayment_clamped_to_zero() {
        assert_eq!(
            reduce_balance(dec!(100), dec!(150), OverpaymentPolicy::Clamp).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_overpayment_rejected() {
        let err = reduce_balance(dec!(100), dec!(150), OverpaymentPolicy::Reject).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
