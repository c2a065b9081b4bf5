//! Correlation Tracker - outstanding requests awaiting a response
//!
//! Every entry is removed exactly once. `resolve`, `fail`, `cancel` and
//! `sweep` all take the entry out of the table under the same lock before
//! acting on it, so a response racing a timeout can only ever win or lose.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::message::{CorrelationId, Message};
use super::{BusError, Result};

struct Entry {
    deadline: Instant,
    reply: oneshot::Sender<Result<Message>>,
}

/// Handle held by the caller waiting for a response
#[derive(Debug)]
pub struct Waiter {
    correlation_id: CorrelationId,
    deadline: Instant,
    reply: oneshot::Receiver<Result<Message>>,
}

impl Waiter {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the outcome. The tracker's sweep enforces the deadline.
    pub async fn wait(self) -> Result<Message> {
        self.reply.await.unwrap_or(Err(BusError::BusClosed))
    }

    /// Wait until the deadline. `None` means the deadline passed with the
    /// entry possibly still registered.
    pub(crate) async fn wait_until_deadline(&mut self) -> Option<Result<Message>> {
        match tokio::time::timeout_at(self.deadline, &mut self.reply).await {
            Ok(outcome) => Some(outcome.unwrap_or(Err(BusError::BusClosed))),
            Err(_) => None,
        }
    }
}

/// Table of pending request/response correlations
#[derive(Default)]
pub struct CorrelationTracker {
    entries: Mutex<HashMap<CorrelationId, Entry>>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// Fails with `DuplicateCorrelation` while another live waiter holds the
    /// same id. An entry whose waiter was dropped is replaced.
    pub fn register(&self, correlation_id: CorrelationId, deadline: Instant) -> Result<Waiter> {
        let (tx, rx) = oneshot::channel();

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&correlation_id) {
            if !existing.reply.is_closed() {
                return Err(BusError::DuplicateCorrelation {
                    correlation_id: correlation_id.to_string(),
                });
            }
        }
        entries.insert(
            correlation_id.clone(),
            Entry {
                deadline,
                reply: tx,
            },
        );

        Ok(Waiter {
            correlation_id,
            deadline,
            reply: rx,
        })
    }

    /// Deliver a response. Returns false for late or duplicate responses.
    pub fn resolve(&self, correlation_id: &CorrelationId, response: Message) -> bool {
        let entry = self.entries.lock().remove(correlation_id);
        match entry {
            Some(entry) => {
                let delivered = entry.reply.send(Ok(response)).is_ok();
                if !delivered {
                    debug!("Waiter for {} was dropped before resolution", correlation_id);
                }
                delivered
            }
            None => false,
        }
    }

    /// Fail a waiting request. Returns false if it was already gone.
    pub fn fail(&self, correlation_id: &CorrelationId, error: BusError) -> bool {
        let entry = self.entries.lock().remove(correlation_id);
        match entry {
            Some(entry) => {
                let _ = entry.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove an entry without notifying its waiter
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.lock().remove(correlation_id).is_some()
    }

    /// Fail every entry whose deadline is at or before `now`, returning the
    /// ids that timed out.
    pub fn sweep(&self, now: Instant) -> Vec<CorrelationId> {
        let expired: Vec<(CorrelationId, Entry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<CorrelationId> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.reply.send(Err(BusError::CorrelationTimeout {
                    correlation_id: id.to_string(),
                }));
                id
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.lock().contains_key(correlation_id)
    }

    /// Fail every outstanding entry, used at shutdown
    pub fn fail_all(&self, error: impl Fn() -> BusError) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(error()));
        }
        count
    }
}
