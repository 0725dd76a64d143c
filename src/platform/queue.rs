//! Bounded priority request queue (spec §4.6a). Requests above capacity
//! are rejected with `QueueFull` (non-retryable); admitted requests are
//! released in priority order (`critical` > `high` > `normal` > `low`).
//! Shaped after the shared-state-behind-a-channel convention used for
//! `job_queue.rs`'s `mpsc` dispatch, generalized to priority.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use super::errors::PlatformError;
use crate::broker::Priority;

struct Ticket {
    priority: Priority,
    seq: u64,
    notify: Arc<Notify>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    /// Higher priority first; for equal priority, earlier sequence number
    /// (FIFO) wins. `BinaryHeap` is a max-heap, so this orders correctly
    /// when popped with `.pop()`.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    pending: BinaryHeap<Ticket>,
    next_seq: u64,
    in_flight: usize,
}

pub struct RequestQueue {
    capacity: usize,
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl RequestQueue {
    pub fn new(capacity: usize, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            max_concurrent,
            inner: Mutex::new(Inner { pending: BinaryHeap::new(), next_seq: 0, in_flight: 0 }),
        })
    }

    /// Admit a request at `priority`. Resolves once a concurrency slot is
    /// granted, in priority order among all currently-queued waiters.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> Result<QueuePermit, PlatformError> {
        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().await;
            if inner.pending.len() + inner.in_flight >= self.capacity {
                return Err(PlatformError::QueueFull);
            }
            if inner.in_flight < self.max_concurrent && inner.pending.is_empty() {
                inner.in_flight += 1;
                return Ok(QueuePermit { queue: self.clone(), released: false });
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(Ticket { priority, seq, notify: notify.clone() });
        }
        notify.notified().await;
        Ok(QueuePermit { queue: self.clone(), released: false })
    }

    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if let Some(next) = inner.pending.pop() {
            inner.in_flight += 1;
            next.notify.notify_one();
        }
    }
}

pub struct QueuePermit {
    queue: Arc<RequestQueue>,
    released: bool,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let queue = self.queue.clone();
        tokio::spawn(async move { queue.release().await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_over_capacity() {
        let queue = RequestQueue::new(1, 1);
        let _first = queue.acquire(Priority::Normal).await.unwrap();
        let second = queue.acquire(Priority::Normal).await;
        assert!(matches!(second, Err(PlatformError::QueueFull)));
    }

    #[tokio::test]
    async fn higher_priority_is_granted_first() {
        let queue = RequestQueue::new(10, 1);
        let first = queue.acquire(Priority::Normal).await.unwrap();

        let queue_high = queue.clone();
        let high_task = tokio::spawn(async move { queue_high.acquire(Priority::High).await });
        let queue_low = queue.clone();
        let low_task = tokio::spawn(async move { queue_low.acquire(Priority::Low).await });

        tokio::task::yield_now().await;
        drop(first);
        // give the release task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let high_permit = high_task.await.unwrap();
        assert!(high_permit.is_ok());
        drop(high_permit);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let low_permit = low_task.await.unwrap();
        assert!(low_permit.is_ok());
    }
}
