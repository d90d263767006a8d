//! Task enqueuer. Validates SMS batches and submits them to the work queue.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use jonche_common::types::{QueueClass, SendSmsPayload};

use crate::queue::{QueueBackend, QueueError, TaskEnvelope};

/// Fixed delay between attempts of a failed task.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Retry budget for single-payment confirmations.
pub const PAYMENT_MAX_RETRY: u32 = 3;

/// Retry budget for operator bulk sends.
pub const BULK_MAX_RETRY: u32 = 2;

/// Lane and retry budget of an enqueued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: QueueClass,
    pub max_retry: u32,
}

impl EnqueueOptions {
    pub fn payment_confirmation() -> Self {
        Self {
            queue: QueueClass::Critical,
            max_retry: PAYMENT_MAX_RETRY,
        }
    }

    pub fn bulk_manual() -> Self {
        Self {
            queue: QueueClass::Default,
            max_retry: BULK_MAX_RETRY,
        }
    }
}

/// Producer side of the work queue.
#[derive(Clone)]
pub struct TaskEnqueuer {
    backend: Arc<dyn QueueBackend>,
}

impl TaskEnqueuer {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Submit a batch. Returns the task id.
    ///
    /// Malformed batches are rejected before anything touches the queue.
    pub async fn enqueue(
        &self,
        payload: SendSmsPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        payload
            .validate()
            .map_err(|e| QueueError::Validation(e.to_string()))?;

        let envelope = TaskEnvelope::new(options.queue, options.max_retry, payload);
        let raw = envelope.encode()?;
        self.backend.push(options.queue, raw).await?;

        tracing::info!(
            task_id = %envelope.id,
            queue = %options.queue,
            max_retry = options.max_retry,
            messages = envelope.payload.len(),
            "SMS task enqueued"
        );

        Ok(envelope.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;

    fn payload(messages: usize, phones: usize) -> SendSmsPayload {
        SendSmsPayload {
            phone_numbers: (0..phones).map(|i| format!("07120000{:02}", i)).collect(),
            messages: (0..messages).map(|i| format!("hello {}", i)).collect(),
            ref_ids: (0..messages).map(|_| Uuid::new_v4()).collect(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_lands_on_requested_lane() {
        let queue = Arc::new(MemoryQueue::new());
        let enqueuer = TaskEnqueuer::new(queue.clone());

        let id = enqueuer
            .enqueue(payload(2, 2), EnqueueOptions::payment_confirmation())
            .await
            .unwrap();

        let pending = queue.pending(QueueClass::Critical).await;
        assert_eq!(pending.len(), 1);
        let envelope = TaskEnvelope::decode(&pending[0]).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.max_retry, PAYMENT_MAX_RETRY);
        assert_eq!(envelope.retried, 0);
        assert_eq!(envelope.payload.len(), 2);
    }

    #[tokio::test]
    async fn test_mismatched_lengths_rejected_without_side_effects() {
        let queue = Arc::new(MemoryQueue::new());
        let enqueuer = TaskEnqueuer::new(queue.clone());

        let result = enqueuer
            .enqueue(payload(2, 1), EnqueueOptions::bulk_manual())
            .await;

        assert!(matches!(result, Err(QueueError::Validation(_))));
        for lane in QueueClass::ALL {
            assert!(queue.pending(lane).await.is_empty());
        }
    }

    #[test]
    fn test_call_site_budgets() {
        assert_eq!(EnqueueOptions::payment_confirmation().max_retry, 3);
        assert_eq!(EnqueueOptions::bulk_manual().max_retry, 2);
        assert_eq!(EnqueueOptions::bulk_manual().queue, QueueClass::Default);
    }
}
