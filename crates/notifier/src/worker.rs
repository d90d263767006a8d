//! Task worker pool.
//!
//! Each priority lane gets its own set of consumers. A consumer reserves one
//! task, sends every message in it, writes each result back, then
//! acknowledges or reschedules the task before taking the next one.
//!
//! Messages inside a task are independent: a permanent rejection is recorded
//! and forgotten, a transient failure is retried on its own without resending
//! the messages that already went out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use jonche_common::types::{DeliveryStatus, QueueClass};

use crate::delivery_log::{DeliveryAttempt, DeliveryLog};
use crate::enqueuer::DEFAULT_RETRY_DELAY;
use crate::gateway::{OutboundSms, SmsGateway};
use crate::phone::normalize_phone_number;
use crate::queue::{QueueBackend, QueueError, Reservation, TaskEnvelope};

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub critical_concurrency: usize,
    pub default_concurrency: usize,
    pub low_concurrency: usize,
    /// Idle delay after finding a lane empty.
    pub poll_interval: Duration,
    /// Fixed backoff before a failed task is attempted again.
    pub retry_delay: Duration,
    /// Return every lane's in-flight tasks to pending on start.
    ///
    /// In-flight lists are shared by all consumers, so recovery assumes this
    /// is the only worker process. When several run against one Redis, only
    /// one of them may recover, and only while the others are stopped;
    /// otherwise live tasks are pulled away and sent twice.
    pub recover_inflight: bool,
}

impl WorkerConfig {
    pub fn concurrency(&self, queue: QueueClass) -> usize {
        match queue {
            QueueClass::Critical => self.critical_concurrency,
            QueueClass::Default => self.default_concurrency,
            QueueClass::Low => self.low_concurrency,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            critical_concurrency: 10,
            default_concurrency: 5,
            low_concurrency: 2,
            poll_interval: Duration::from_millis(250),
            retry_delay: DEFAULT_RETRY_DELAY,
            recover_inflight: true,
        }
    }
}

/// Per-task tally.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub sent: usize,
    pub rejected: usize,
    pub skipped: usize,
    /// Indices into the task payload that failed transiently.
    pub retry: Vec<usize>,
    pub last_error: Option<String>,
}

/// Processes reserved tasks end to end.
pub struct TaskProcessor {
    backend: Arc<dyn QueueBackend>,
    gateway: Arc<dyn SmsGateway>,
    log: Arc<dyn DeliveryLog>,
    retry_delay: Duration,
}

impl TaskProcessor {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        gateway: Arc<dyn SmsGateway>,
        log: Arc<dyn DeliveryLog>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            backend,
            gateway,
            log,
            retry_delay,
        }
    }

    /// Send every message of `envelope` once.
    pub async fn process(&self, envelope: &TaskEnvelope) -> TaskOutcome {
        let mut outcome = TaskOutcome::default();

        for (index, (message, phone, correlation_id)) in envelope.payload.entries().enumerate() {
            match self.log.status(correlation_id).await {
                Ok(Some(DeliveryStatus::Pending)) => {}
                Ok(Some(status)) => {
                    // Redelivered task: this message was already handled.
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        status = %status,
                        "Skipping message already past pending"
                    );
                    outcome.skipped += 1;
                    continue;
                }
                Ok(None) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        task_id = %envelope.id,
                        "No notification for correlation id, skipping message"
                    );
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => {
                    outcome.retry.push(index);
                    outcome.last_error = Some(e.to_string());
                    continue;
                }
            }

            let sms = OutboundSms {
                to: normalize_phone_number(phone),
                message: message.to_string(),
                correlation_id,
            };

            let attempt = match self.gateway.send(&sms).await {
                Ok(receipt) => {
                    outcome.sent += 1;
                    DeliveryAttempt::Accepted(receipt)
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        task_id = %envelope.id,
                        retried = envelope.retried,
                        error = %e,
                        "Transient gateway failure"
                    );
                    outcome.retry.push(index);
                    outcome.last_error = Some(e.to_string());
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        task_id = %envelope.id,
                        error = %e,
                        "Gateway rejected message"
                    );
                    outcome.rejected += 1;
                    DeliveryAttempt::Rejected {
                        reason: e.to_string(),
                    }
                }
            };

            // The gateway already acted; a failed write-back must not cause a resend.
            if let Err(e) = self.log.record(correlation_id, &attempt).await {
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to record delivery attempt"
                );
            }
        }

        outcome
    }

    /// Process a reserved task and settle it with the queue.
    pub async fn handle(&self, reservation: Reservation) {
        let decoded = TaskEnvelope::decode(&reservation.raw).and_then(|envelope| {
            envelope
                .payload
                .validate()
                .map_err(|e| QueueError::Validation(e.to_string()))?;
            Ok(envelope)
        });
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(queue = %reservation.queue, error = %e, "Dropping malformed task");
                self.settle_ack(&reservation).await;
                return;
            }
        };

        let outcome = self.process(&envelope).await;
        tracing::info!(
            task_id = %envelope.id,
            queue = %envelope.queue,
            sent = outcome.sent,
            rejected = outcome.rejected,
            skipped = outcome.skipped,
            failed = outcome.retry.len(),
            "SMS task processed"
        );

        if outcome.retry.is_empty() {
            self.settle_ack(&reservation).await;
            return;
        }

        let last_error = outcome
            .last_error
            .unwrap_or_else(|| "unknown error".to_string());

        if envelope.retries_exhausted() {
            tracing::error!(
                task_id = %envelope.id,
                kind = %envelope.kind,
                queue = %envelope.queue,
                retried = envelope.retried,
                failed = outcome.retry.len(),
                error = %last_error,
                "Retry exhausted for task"
            );
            let remaining = envelope.payload.subset(&outcome.retry);
            for (_, _, correlation_id) in remaining.entries() {
                let attempt = DeliveryAttempt::Exhausted {
                    reason: format!("retry exhausted: {}", last_error),
                };
                if let Err(e) = self.log.record(correlation_id, &attempt).await {
                    tracing::error!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Failed to record exhausted delivery"
                    );
                }
            }
            self.settle_ack(&reservation).await;
            return;
        }

        let next = envelope.next_attempt(envelope.payload.subset(&outcome.retry));
        let scheduled = match next.encode() {
            Ok(raw) => {
                self.backend
                    .schedule_retry(&reservation, raw, self.retry_delay)
                    .await
            }
            Err(e) => Err(e),
        };
        match scheduled {
            Ok(()) => tracing::info!(
                task_id = %next.id,
                retried = next.retried,
                max_retry = next.max_retry,
                delay_ms = self.retry_delay.as_millis() as u64,
                "Retry scheduled"
            ),
            // Left in flight; the next worker start returns it to its lane.
            Err(e) => tracing::error!(task_id = %next.id, error = %e, "Failed to schedule retry"),
        }
    }

    async fn settle_ack(&self, reservation: &Reservation) {
        if let Err(e) = self.backend.ack(reservation).await {
            tracing::error!(queue = %reservation.queue, error = %e, "Failed to acknowledge task");
        }
    }
}

/// Concurrent consumers over every priority lane.
pub struct WorkerPool {
    backend: Arc<dyn QueueBackend>,
    processor: Arc<TaskProcessor>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        gateway: Arc<dyn SmsGateway>,
        log: Arc<dyn DeliveryLog>,
        config: WorkerConfig,
    ) -> Self {
        let processor = Arc::new(TaskProcessor::new(
            backend.clone(),
            gateway,
            log,
            config.retry_delay,
        ));
        Self {
            backend,
            processor,
            config,
        }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Consumers stop taking new tasks once shutdown is signalled and finish
    /// the one in hand; this returns when all of them have exited.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.config.recover_inflight {
            self.backend.requeue_inflight().await?;
        } else {
            tracing::info!("In-flight recovery disabled, leaving reserved tasks in place");
        }

        let mut consumers = JoinSet::new();
        for queue in QueueClass::ALL {
            let concurrency = self.config.concurrency(queue);
            for worker in 0..concurrency {
                consumers.spawn(consume(
                    queue,
                    worker,
                    self.backend.clone(),
                    self.processor.clone(),
                    self.config.poll_interval,
                    shutdown.clone(),
                ));
            }
            tracing::info!(queue = %queue, concurrency, "Queue consumers started");
        }
        consumers.spawn(promote_retries(
            self.backend.clone(),
            self.config.poll_interval,
            shutdown.clone(),
        ));

        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        tracing::info!("Worker pool drained");
        Ok(())
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns `false` on shutdown.
async fn idle(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn consume(
    queue: QueueClass,
    worker: usize,
    backend: Arc<dyn QueueBackend>,
    processor: Arc<TaskProcessor>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match backend.reserve(queue).await {
            Ok(Some(reservation)) => processor.handle(reservation).await,
            Ok(None) => {
                if !idle(poll_interval, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(queue = %queue, worker, error = %e, "Failed to reserve task");
                if !idle(poll_interval, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    tracing::debug!(queue = %queue, worker, "Consumer stopped");
}

async fn promote_retries(
    backend: Arc<dyn QueueBackend>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = backend.promote_due().await {
            tracing::warn!(error = %e, "Failed to promote due retries");
        }
        if !idle(interval, &mut shutdown).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use jonche_common::error::AppError;
    use jonche_common::types::SendSmsPayload;

    use super::*;
    use crate::enqueuer::{EnqueueOptions, TaskEnqueuer};
    use crate::gateway::{GatewayError, GatewayReceipt};
    use crate::memory::MemoryQueue;

    #[derive(Clone, Copy)]
    enum Script {
        Accept,
        Reject,
        Unavailable,
    }

    /// Gateway whose answer depends on the recipient.
    #[derive(Default)]
    struct FakeGateway {
        scripts: HashMap<String, Script>,
        sent: Mutex<Vec<OutboundSms>>,
    }

    impl FakeGateway {
        fn with(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(to, s)| (to.to_string(), *s))
                    .collect(),
                sent: Mutex::new(Vec::new()),
            }
        }

        async fn recipients(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|s| s.to.clone()).collect()
        }
    }

    #[async_trait]
    impl SmsGateway for FakeGateway {
        async fn send(&self, sms: &OutboundSms) -> Result<GatewayReceipt, GatewayError> {
            self.sent.lock().await.push(sms.clone());
            match self.scripts.get(&sms.to).copied().unwrap_or(Script::Accept) {
                Script::Accept => Ok(GatewayReceipt {
                    cost: Some("KES 0.8".into()),
                    description: Some("Sent".into()),
                    provider_message_id: Some(format!("msg-{}", sms.correlation_id)),
                }),
                Script::Reject => Err(GatewayError::Rejected("invalid recipient".into())),
                Script::Unavailable => Err(GatewayError::Transient("HTTP 503".into())),
            }
        }
    }

    #[derive(Default)]
    struct MemoryLog {
        statuses: Mutex<HashMap<Uuid, DeliveryStatus>>,
        attempts: Mutex<Vec<(Uuid, DeliveryAttempt)>>,
    }

    impl MemoryLog {
        async fn insert(&self, id: Uuid, status: DeliveryStatus) {
            self.statuses.lock().await.insert(id, status);
        }

        async fn get(&self, id: Uuid) -> Option<DeliveryStatus> {
            self.statuses.lock().await.get(&id).copied()
        }
    }

    #[async_trait]
    impl DeliveryLog for MemoryLog {
        async fn status(&self, id: Uuid) -> Result<Option<DeliveryStatus>, AppError> {
            Ok(self.get(id).await)
        }

        async fn record(&self, id: Uuid, attempt: &DeliveryAttempt) -> Result<bool, AppError> {
            let mut statuses = self.statuses.lock().await;
            match statuses.get_mut(&id) {
                Some(status) if !status.is_terminal() => {
                    *status = attempt.resulting_status();
                    self.attempts.lock().await.push((id, attempt.clone()));
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        gateway: Arc<FakeGateway>,
        log: Arc<MemoryLog>,
        processor: TaskProcessor,
    }

    fn harness(gateway: FakeGateway) -> Harness {
        let queue = Arc::new(MemoryQueue::new());
        let gateway = Arc::new(gateway);
        let log = Arc::new(MemoryLog::default());
        let processor =
            TaskProcessor::new(queue.clone(), gateway.clone(), log.clone(), Duration::ZERO);
        Harness {
            queue,
            gateway,
            log,
            processor,
        }
    }

    async fn pending_batch(log: &MemoryLog, phones: &[&str]) -> SendSmsPayload {
        let ref_ids: Vec<Uuid> = phones.iter().map(|_| Uuid::new_v4()).collect();
        for id in &ref_ids {
            log.insert(*id, DeliveryStatus::Pending).await;
        }
        SendSmsPayload {
            phone_numbers: phones.iter().map(|p| p.to_string()).collect(),
            messages: phones.iter().map(|p| format!("Hello {}", p)).collect(),
            ref_ids,
        }
    }

    async fn enqueue(h: &Harness, payload: SendSmsPayload, max_retry: u32) {
        TaskEnqueuer::new(h.queue.clone())
            .enqueue(
                payload,
                EnqueueOptions {
                    queue: QueueClass::Critical,
                    max_retry,
                },
            )
            .await
            .unwrap();
    }

    async fn handle_next(h: &Harness) {
        let reservation = h.queue.reserve(QueueClass::Critical).await.unwrap().unwrap();
        h.processor.handle(reservation).await;
    }

    #[tokio::test]
    async fn test_batch_sent_and_acknowledged() {
        let h = harness(FakeGateway::default());
        let payload = pending_batch(&h.log, &["0712345678", "+254 722 000 111"]).await;
        enqueue(&h, payload.clone(), 3).await;

        handle_next(&h).await;

        assert_eq!(
            h.gateway.recipients().await,
            vec!["254712345678", "254722000111"]
        );
        for id in &payload.ref_ids {
            assert_eq!(h.log.get(*id).await, Some(DeliveryStatus::Sent));
        }
        assert_eq!(h.queue.inflight_len(QueueClass::Critical).await, 0);
        assert_eq!(h.queue.scheduled_len().await, 0);
    }

    #[tokio::test]
    async fn test_rejection_does_not_affect_siblings_or_retry() {
        let h = harness(FakeGateway::with(&[("254700000001", Script::Reject)]));
        let payload = pending_batch(&h.log, &["0700000001", "0700000002"]).await;
        enqueue(&h, payload.clone(), 3).await;

        handle_next(&h).await;

        assert_eq!(h.log.get(payload.ref_ids[0]).await, Some(DeliveryStatus::Failed));
        assert_eq!(h.log.get(payload.ref_ids[1]).await, Some(DeliveryStatus::Sent));
        assert_eq!(h.queue.scheduled_len().await, 0);
        assert_eq!(h.queue.inflight_len(QueueClass::Critical).await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_only_failed_message() {
        let h = harness(FakeGateway::with(&[("254700000002", Script::Unavailable)]));
        let payload = pending_batch(&h.log, &["0700000001", "0700000002"]).await;
        enqueue(&h, payload.clone(), 3).await;

        handle_next(&h).await;

        assert_eq!(h.log.get(payload.ref_ids[0]).await, Some(DeliveryStatus::Sent));
        assert_eq!(h.log.get(payload.ref_ids[1]).await, Some(DeliveryStatus::Pending));
        assert_eq!(h.queue.scheduled_len().await, 1);

        assert_eq!(h.queue.promote_due().await.unwrap(), 1);
        let pending = h.queue.pending(QueueClass::Critical).await;
        let retry = TaskEnvelope::decode(&pending[0]).unwrap();
        assert_eq!(retry.retried, 1);
        assert_eq!(retry.payload.ref_ids, vec![payload.ref_ids[1]]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_marked_failed_and_done() {
        let h = harness(FakeGateway::with(&[("254700000001", Script::Unavailable)]));
        let payload = pending_batch(&h.log, &["0700000001"]).await;
        enqueue(&h, payload.clone(), 1).await;

        // First attempt plus one retry.
        handle_next(&h).await;
        h.queue.promote_due().await.unwrap();
        handle_next(&h).await;

        assert_eq!(h.gateway.recipients().await.len(), 2);
        assert_eq!(h.log.get(payload.ref_ids[0]).await, Some(DeliveryStatus::Failed));
        assert_eq!(h.queue.scheduled_len().await, 0);
        assert!(h.queue.pending(QueueClass::Critical).await.is_empty());
        assert_eq!(h.queue.inflight_len(QueueClass::Critical).await, 0);

        let attempts = h.log.attempts.lock().await;
        assert!(matches!(attempts[0].1, DeliveryAttempt::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_terminal_notification_not_resent() {
        let h = harness(FakeGateway::default());
        let payload = pending_batch(&h.log, &["0700000001"]).await;
        h.log
            .insert(payload.ref_ids[0], DeliveryStatus::Delivered)
            .await;
        enqueue(&h, payload.clone(), 3).await;

        handle_next(&h).await;

        assert!(h.gateway.recipients().await.is_empty());
        assert_eq!(
            h.log.get(payload.ref_ids[0]).await,
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_malformed_task_dropped() {
        let h = harness(FakeGateway::default());
        h.queue
            .push(QueueClass::Critical, "not json".to_string())
            .await
            .unwrap();

        handle_next(&h).await;

        assert_eq!(h.queue.inflight_len(QueueClass::Critical).await, 0);
        assert!(h.gateway.recipients().await.is_empty());
    }

    #[tokio::test]
    async fn test_pool_drains_then_stops_on_shutdown() {
        let queue = Arc::new(MemoryQueue::new());
        let gateway = Arc::new(FakeGateway::default());
        let log = Arc::new(MemoryLog::default());
        let payload = pending_batch(&log, &["0700000001", "0700000002"]).await;
        TaskEnqueuer::new(queue.clone())
            .enqueue(payload.clone(), EnqueueOptions::bulk_manual())
            .await
            .unwrap();

        let pool = WorkerPool::new(
            queue.clone(),
            gateway.clone(),
            log.clone(),
            WorkerConfig {
                critical_concurrency: 2,
                default_concurrency: 1,
                low_concurrency: 1,
                poll_interval: Duration::from_millis(10),
                retry_delay: Duration::ZERO,
                recover_inflight: true,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { pool.run(rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if log.get(payload.ref_ids[1]).await == Some(DeliveryStatus::Sent) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(log.get(payload.ref_ids[0]).await, Some(DeliveryStatus::Sent));
        assert!(queue.pending(QueueClass::Default).await.is_empty());
    }

    #[tokio::test]
    async fn test_pool_without_recovery_leaves_reserved_tasks_alone() {
        let queue = Arc::new(MemoryQueue::new());
        let gateway = Arc::new(FakeGateway::default());
        let log = Arc::new(MemoryLog::default());
        let payload = pending_batch(&log, &["0700000001"]).await;
        TaskEnqueuer::new(queue.clone())
            .enqueue(payload.clone(), EnqueueOptions::bulk_manual())
            .await
            .unwrap();

        // Another worker process holds the task.
        let held = queue.reserve(QueueClass::Default).await.unwrap();
        assert!(held.is_some());

        let pool = WorkerPool::new(
            queue.clone(),
            gateway.clone(),
            log.clone(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                retry_delay: Duration::ZERO,
                recover_inflight: false,
                ..WorkerConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { pool.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(queue.inflight_len(QueueClass::Default).await, 1);
        assert!(gateway.recipients().await.is_empty());
        assert_eq!(log.get(payload.ref_ids[0]).await, Some(DeliveryStatus::Pending));
    }
}
