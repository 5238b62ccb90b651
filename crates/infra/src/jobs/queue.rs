//! Queue/dispatch boundary between the submitting process and workers.
//!
//! Delivery is at-least-once: a unit stays owned by the queue until it is
//! acknowledged, retried, or dead-lettered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::types::{DeadLetterEntry, WorkUnit};

/// A unit handed to a worker, plus the receipt needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: String,
    pub unit: WorkUnit,
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next ready unit.
    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Processing finished; drop the unit.
    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Settle this delivery and redeliver the unit as its next attempt after `delay`.
    fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Settle this delivery and park the unit for inspection.
    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;

    /// Renew this worker's hold on an unsettled delivery so it is not handed
    /// to another worker. Fails with `LeaseLost` once someone else owns it.
    fn touch(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        (**self).enqueue(unit)
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(timeout)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery)
    }

    fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        (**self).retry(delivery, delay)
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(delivery, reason)
    }

    fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).touch(delivery)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("queue codec error: {0}")]
    Codec(String),
    #[error("unknown delivery receipt: {0}")]
    UnknownReceipt(String),
    #[error("delivery {0} is now owned by another consumer")]
    LeaseLost(String),
    #[error("queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<WorkUnit>,
    delayed: Vec<(Instant, WorkUnit)>,
    in_flight: HashMap<String, WorkUnit>,
    dead: Vec<DeadLetterEntry>,
    next_receipt: u64,
}

impl QueueState {
    /// Move every delayed unit whose time has come to the ready list.
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, unit) = self.delayed.remove(i);
                self.ready.push_back(unit);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn settle(&mut self, receipt: &str) -> Result<WorkUnit, QueueError> {
        self.in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))
    }
}

/// In-process queue for tests/dev and the single-binary API mode.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Units waiting (ready or delayed), excluding in-flight ones.
    pub fn pending(&self) -> usize {
        self.lock().map(|s| s.ready.len() + s.delayed.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Nothing waiting and nothing being processed.
    pub fn is_idle(&self) -> bool {
        self.lock()
            .map(|s| s.ready.is_empty() && s.delayed.is_empty() && s.in_flight.is_empty())
            .unwrap_or(false)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock().map(|s| s.dead.clone()).unwrap_or_default()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, unit: WorkUnit) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.ready.push_back(unit);
        self.available.notify_one();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;

        loop {
            let now = Instant::now();
            state.promote_due(now);

            if let Some(unit) = state.ready.pop_front() {
                state.next_receipt += 1;
                let receipt = state.next_receipt.to_string();
                state.in_flight.insert(receipt.clone(), unit.clone());
                return Ok(Some(Delivery { receipt, unit }));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = state.next_due().map_or(deadline, |due| due.min(deadline));
            let (guard, _) = self
                .available
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .map_err(|_| QueueError::Poisoned)?;
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock()?.settle(&delivery.receipt).map(|_| ())
    }

    fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let unit = state.settle(&delivery.receipt)?.next_attempt();
        if delay.is_zero() {
            state.ready.push_back(unit);
        } else {
            state.delayed.push((Instant::now() + delay, unit));
        }
        // Waiters recompute their wake-up time against the new due entry.
        self.available.notify_all();
        Ok(())
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let unit = state.settle(&delivery.receipt)?;
        state.dead.push(DeadLetterEntry::new(unit, reason));
        Ok(())
    }

    /// In-flight units are never handed out again, so the lease only ends
    /// when the delivery is settled.
    fn touch(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let state = self.lock()?;
        if state.in_flight.contains_key(&delivery.receipt) {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(delivery.receipt.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkjobs_core::{JobId, JobPayload, TicketId};

    fn unit() -> WorkUnit {
        WorkUnit::new(JobId::new(), JobPayload::bulk_delete(vec![TicketId::new(1)]).unwrap())
    }

    #[test]
    fn delivers_in_fifo_order_and_tracks_in_flight() {
        let queue = InMemoryJobQueue::new();
        let (a, b) = (unit(), unit());
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.unit, a);
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&first).unwrap();
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap().unwrap().unit, b);
        assert!(queue.dequeue(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn retry_redelivers_next_attempt_after_delay() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(unit()).unwrap();

        let first = queue.dequeue(Duration::ZERO).unwrap().unwrap();
        queue.retry(&first, Duration::from_millis(30)).unwrap();

        assert!(queue.dequeue(Duration::ZERO).unwrap().is_none());
        assert_eq!(queue.pending(), 1);

        let second = queue.dequeue(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(second.unit.job_id, first.unit.job_id);
        assert_eq!(second.unit.attempt, 2);
    }

    #[test]
    fn dead_letter_parks_unit() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(unit()).unwrap();
        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();

        queue.dead_letter(&delivery, "boom").unwrap();

        assert!(queue.is_idle());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "boom");
        assert_eq!(dead[0].unit, delivery.unit);
    }

    #[test]
    fn settling_twice_is_an_error() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(unit()).unwrap();
        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();

        queue.ack(&delivery).unwrap();
        assert!(matches!(queue.ack(&delivery), Err(QueueError::UnknownReceipt(_))));
    }

    #[test]
    fn touch_holds_until_settled() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(unit()).unwrap();
        let delivery = queue.dequeue(Duration::ZERO).unwrap().unwrap();

        queue.touch(&delivery).unwrap();
        queue.ack(&delivery).unwrap();
        assert!(matches!(queue.touch(&delivery), Err(QueueError::LeaseLost(_))));
    }

    #[test]
    fn blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.dequeue(Duration::from_secs(5)).unwrap())
        };

        std::thread::sleep(Duration::from_millis(20));
        let sent = unit();
        queue.enqueue(sent.clone()).unwrap();

        let got = consumer.join().unwrap().unwrap();
        assert_eq!(got.unit, sent);
    }
}
