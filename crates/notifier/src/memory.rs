//! In-process queue backend for local development and tests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use jonche_common::types::QueueClass;

use crate::queue::{QueueBackend, QueueError, Reservation};

#[derive(Default)]
struct State {
    pending: HashMap<QueueClass, VecDeque<String>>,
    inflight: HashMap<QueueClass, Vec<String>>,
    retry: Vec<(Instant, QueueClass, String)>,
}

/// Non-durable [`QueueBackend`] with the same semantics as the Redis one.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded envelopes waiting on a lane, oldest first.
    pub async fn pending(&self, queue: QueueClass) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .pending
            .get(&queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn inflight_len(&self, queue: QueueClass) -> usize {
        let state = self.state.lock().await;
        state.inflight.get(&queue).map_or(0, Vec::len)
    }

    pub async fn scheduled_len(&self) -> usize {
        self.state.lock().await.retry.len()
    }
}

fn remove_inflight(state: &mut State, reservation: &Reservation) {
    if let Some(list) = state.inflight.get_mut(&reservation.queue)
        && let Some(pos) = list.iter().position(|raw| raw == &reservation.raw)
    {
        list.remove(pos);
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, queue: QueueClass, raw: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.pending.entry(queue).or_default().push_back(raw);
        Ok(())
    }

    async fn reserve(&self, queue: QueueClass) -> Result<Option<Reservation>, QueueError> {
        let mut state = self.state.lock().await;
        let Some(raw) = state.pending.get_mut(&queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        state.inflight.entry(queue).or_default().push(raw.clone());
        Ok(Some(Reservation { queue, raw }))
    }

    async fn ack(&self, reservation: &Reservation) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        remove_inflight(&mut state, reservation);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        reservation: &Reservation,
        raw: String,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        remove_inflight(&mut state, reservation);
        state
            .retry
            .push((Instant::now() + delay, reservation.queue, raw));
        Ok(())
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            state.retry.drain(..).partition(|(at, _, _)| *at <= now);
        state.retry = waiting;

        let promoted = due.len();
        for (_, queue, raw) in due {
            state.pending.entry(queue).or_default().push_back(raw);
        }
        Ok(promoted)
    }

    async fn requeue_inflight(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let stranded: Vec<(QueueClass, Vec<String>)> = state.inflight.drain().collect();

        let mut requeued = 0;
        for (queue, raws) in stranded {
            let lane = state.pending.entry(queue).or_default();
            for raw in raws.into_iter().rev() {
                lane.push_front(raw);
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}
