//! Per-tier FIFO queues feeding the dispatch loop
//!
//! Strict priority: a lower tier is only served when every higher tier is
//! empty. There is no aging, so sustained CRITICAL traffic can starve LOW.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use super::message::Priority;

struct Tiers<T> {
    queues: [VecDeque<T>; 4],
    closed: bool,
}

impl<T> Tiers<T> {
    fn pop_highest(&mut self) -> Option<(Priority, T)> {
        for priority in Priority::ALL {
            if let Some(item) = self.queues[priority.tier()].pop_front() {
                return Some((priority, item));
            }
        }
        None
    }
}

/// Set of four priority queues with a single async consumer
pub struct PriorityQueueSet<T> {
    tiers: Mutex<Tiers<T>>,
    available: Notify,
}

impl<T> PriorityQueueSet<T> {
    pub fn new() -> Self {
        Self {
            tiers: Mutex::new(Tiers {
                queues: [
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Append to the tail of the tier. Hands the item back once closed.
    pub fn push(&self, priority: Priority, item: T) -> Result<(), T> {
        {
            let mut tiers = self.tiers.lock();
            if tiers.closed {
                return Err(item);
            }
            tiers.queues[priority.tier()].push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the oldest item of the highest non-empty tier without waiting
    pub fn try_pop(&self) -> Option<(Priority, T)> {
        self.tiers.lock().pop_highest()
    }

    /// Wait for the next item. Items queued before `close` are still
    /// returned; `None` means closed and drained.
    pub async fn pop(&self) -> Option<(Priority, T)> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut tiers = self.tiers.lock();
                if let Some(item) = tiers.pop_highest() {
                    return Some(item);
                }
                if tiers.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting pushes and wake the consumer
    pub fn close(&self) {
        self.tiers.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.tiers.lock().closed
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().queues.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued items per tier, in dispatch order
    pub fn depths(&self) -> [usize; 4] {
        let tiers = self.tiers.lock();
        [
            tiers.queues[0].len(),
            tiers.queues[1].len(),
            tiers.queues[2].len(),
            tiers.queues[3].len(),
        ]
    }
}

impl<T> Default for PriorityQueueSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
