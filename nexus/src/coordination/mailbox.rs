//! Agent Mailbox - bounded per-agent inbound queue
//!
//! The bus holds a cloneable [`Mailbox`] handle that can only enqueue; the
//! agent owns the single [`MailboxReceiver`]. Capacity is fixed when the
//! mailbox is created.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::message::Message;
use super::{BusError, Result};
use crate::agents::AgentId;

/// What the bus does when a destination mailbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Reject the copy and retry it after backoff
    #[default]
    RejectNew,

    /// Evict the oldest queued message to make room
    DropOldest,

    /// Wait for space up to the configured timeout, then retry
    Block,
}

struct Slots {
    queue: VecDeque<Message>,
    closed: bool,
}

struct Shared {
    owner: AgentId,
    capacity: usize,
    slots: Mutex<Slots>,
    readable: Notify,
    writable: Notify,
}

/// Create a mailbox with its receiving half
pub fn mailbox(owner: AgentId, capacity: usize) -> Result<(Mailbox, MailboxReceiver)> {
    if capacity == 0 {
        return Err(BusError::InvalidCapacity {
            agent_id: owner.to_string(),
            capacity,
        });
    }

    let shared = Arc::new(Shared {
        owner,
        capacity,
        slots: Mutex::new(Slots {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            closed: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    Ok((
        Mailbox {
            shared: shared.clone(),
        },
        MailboxReceiver { shared },
    ))
}

/// Enqueue handle held by the bus
#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<Shared>,
}

impl Mailbox {
    pub fn owner(&self) -> &AgentId {
        &self.shared.owner
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.slots.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slots.lock().closed
    }

    /// Append a message. Returns false when full or closed.
    pub fn enqueue(&self, message: Message) -> bool {
        self.try_enqueue(message).is_ok()
    }

    /// Append a message, handing it back when full or closed
    pub fn try_enqueue(&self, message: Message) -> std::result::Result<(), Message> {
        {
            let mut slots = self.shared.slots.lock();
            if slots.closed || slots.queue.len() >= self.shared.capacity {
                return Err(message);
            }
            slots.queue.push_back(message);
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Append a message, evicting the oldest one when full.
    ///
    /// Returns `Ok(evicted)` on success, or hands the message back when the
    /// mailbox is closed.
    pub fn enqueue_displacing(
        &self,
        message: Message,
    ) -> std::result::Result<Option<Message>, Message> {
        let evicted = {
            let mut slots = self.shared.slots.lock();
            if slots.closed {
                return Err(message);
            }
            let evicted = if slots.queue.len() >= self.shared.capacity {
                slots.queue.pop_front()
            } else {
                None
            };
            slots.queue.push_back(message);
            evicted
        };
        self.shared.readable.notify_one();
        Ok(evicted)
    }

    /// Wait up to `timeout` for space. Returns false on timeout or close.
    pub async fn enqueue_timeout(&self, message: Message, timeout: Duration) -> bool {
        self.try_enqueue_timeout(message, timeout).await.is_ok()
    }

    /// Like [`enqueue_timeout`](Self::enqueue_timeout) but hands the message
    /// back on failure
    pub async fn try_enqueue_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> std::result::Result<(), Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.shared.slots.lock();
                if slots.closed {
                    return Err(message);
                }
                if slots.queue.len() < self.shared.capacity {
                    slots.queue.push_back(message);
                    drop(slots);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(message);
            }
        }
    }

    /// Reject further enqueues and wake the receiver and blocked producers
    pub(crate) fn close(&self) {
        self.shared.slots.lock().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Take every queued message, leaving the mailbox empty
    pub(crate) fn drain_pending(&self) -> Vec<Message> {
        let drained: Vec<Message> = self.shared.slots.lock().queue.drain(..).collect();
        self.shared.writable.notify_waiters();
        drained
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("owner", &self.shared.owner)
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .finish()
    }
}

/// Receiving half, owned by the agent
pub struct MailboxReceiver {
    shared: Arc<Shared>,
}

impl MailboxReceiver {
    pub fn owner(&self) -> &AgentId {
        &self.shared.owner
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.slots.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the next message without waiting
    pub fn try_dequeue(&mut self) -> Option<Message> {
        let message = self.shared.slots.lock().queue.pop_front();
        if message.is_some() {
            self.shared.writable.notify_one();
        }
        message
    }

    /// Wait for the next message. `None` once closed and empty.
    pub async fn dequeue(&mut self) -> Option<Message> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.shared.slots.lock();
                let next = slots.queue.pop_front();
                if let Some(message) = next {
                    drop(slots);
                    self.shared.writable.notify_one();
                    return Some(message);
                }
                if slots.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Like [`dequeue`](Self::dequeue) but gives up when `cancel` fires
    pub async fn dequeue_cancellable(&mut self, cancel: &CancellationToken) -> Result<Message> {
        let owner = self.shared.owner.to_string();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BusError::Cancelled),
            message = self.dequeue() => message.ok_or(BusError::MailboxClosed { agent_id: owner }),
        }
    }
}

impl std::fmt::Debug for MailboxReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxReceiver")
            .field("owner", &self.shared.owner)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u32) -> Message {
        Message::direct("sender", "owner", json!(n))
    }

    fn payloads(rx: &mut MailboxReceiver) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| rx.try_dequeue().map(|m| m.payload().clone())).collect()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = mailbox(AgentId::from("owner"), 0).unwrap_err();
        assert!(matches!(err, BusError::InvalidCapacity { capacity: 0, .. }));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (tx, mut rx) = mailbox(AgentId::from("owner"), 2).unwrap();
        assert!(tx.enqueue(msg(1)));
        assert!(tx.enqueue(msg(2)));
        assert!(!tx.enqueue(msg(3)));
        assert_eq!(tx.len(), 2);

        rx.try_dequeue().unwrap();
        assert!(tx.enqueue(msg(3)));
        assert_eq!(payloads(&mut rx), vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_displacing_evicts_oldest() {
        let (tx, mut rx) = mailbox(AgentId::from("owner"), 2).unwrap();
        tx.enqueue(msg(1));
        tx.enqueue(msg(2));

        let evicted = tx.enqueue_displacing(msg(3)).unwrap();
        assert_eq!(evicted.unwrap().payload(), &json!(1));
        assert_eq!(payloads(&mut rx), vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_enqueue_timeout_waits_for_space() {
        let (tx, mut rx) = mailbox(AgentId::from("owner"), 1).unwrap();
        tx.enqueue(msg(1));

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.enqueue_timeout(msg(2), Duration::from_secs(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rx.dequeue().await.unwrap().payload(), &json!(1));
        assert!(producer.await.unwrap());
        assert_eq!(rx.dequeue().await.unwrap().payload(), &json!(2));
    }

    #[tokio::test]
    async fn test_enqueue_timeout_gives_up() {
        let (tx, _rx) = mailbox(AgentId::from("owner"), 1).unwrap();
        tx.enqueue(msg(1));
        assert!(!tx.enqueue_timeout(msg(2), Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_dequeue_ends_after_close_and_drain() {
        let (tx, mut rx) = mailbox(AgentId::from("owner"), 4).unwrap();
        tx.enqueue(msg(1));
        tx.close();

        assert!(!tx.enqueue(msg(2)));
        assert!(rx.dequeue().await.is_some());
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_cancellable() {
        let (_tx, mut rx) = mailbox(AgentId::from("owner"), 4).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = rx.dequeue_cancellable(&cancel).await.unwrap_err();
        assert!(matches!(err, BusError::Cancelled));
    }

    #[test]
    fn test_drain_pending_empties_queue() {
        let (tx, _rx) = mailbox(AgentId::from("owner"), 4).unwrap();
        tx.enqueue(msg(1));
        tx.enqueue(msg(2));

        assert_eq!(tx.drain_pending().len(), 2);
        assert!(tx.is_empty());
    }
}
