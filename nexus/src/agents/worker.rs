//! Agent receive loop
//!
//! One task per spawned agent. The loop heartbeats on an interval, dequeues
//! from the agent's mailbox, skips message ids it has already seen, honours
//! cancel control messages and replies to REQUESTs with a [`TaskReply`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AgentBehavior, AgentId};
use crate::coordination::{MailboxReceiver, Message, MessageBus, MessageId, MessageKind};

const CONTROL_KEY: &str = "control";
const CANCEL_CONTROL: &str = "cancel";

/// Receives liveness signals from running agents
pub trait HeartbeatSink: Send + Sync {
    fn beat(&self, agent_id: &AgentId);
}

/// Outcome of a REQUEST as carried by its response.
///
/// A successful reply's payload is the handler's result as-is; a failed
/// reply has a null payload and the reason in [`Message::error`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReply {
    Ok { result: serde_json::Value },
    Error { message: String },
}

impl TaskReply {
    pub fn ok(result: serde_json::Value) -> Self {
        TaskReply::Ok { result }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TaskReply::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TaskReply::Ok { .. })
    }

    /// Read the outcome out of a response
    pub fn from_message(message: &Message) -> Self {
        match message.error() {
            Some(reason) => TaskReply::error(reason),
            None => TaskReply::ok(message.payload().clone()),
        }
    }

    /// Response to `request` sent by `sender`
    pub fn into_reply(self, request: &Message, sender: AgentId) -> Message {
        match self {
            TaskReply::Ok { result } => request.reply(sender, result),
            TaskReply::Error { message } => request.reply_error(sender, message),
        }
    }
}

/// Control payload asking an agent to drop a task
pub fn cancel_payload(task_id: &MessageId) -> serde_json::Value {
    serde_json::json!({ "control": CANCEL_CONTROL, "task_id": task_id.as_str() })
}

fn cancel_target(message: &Message) -> Option<String> {
    let payload = message.payload();
    if payload.get(CONTROL_KEY).and_then(|c| c.as_str()) != Some(CANCEL_CONTROL) {
        return None;
    }
    payload
        .get("task_id")
        .and_then(|t| t.as_str())
        .map(str::to_string)
}

/// What a behavior can reach while handling a message
#[derive(Clone)]
pub struct AgentContext {
    agent_id: AgentId,
    bus: MessageBus,
}

impl AgentContext {
    pub fn new(agent_id: AgentId, bus: MessageBus) -> Self {
        Self { agent_id, bus }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
    pub handler_timeout: Duration,
    pub dedup_window: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            handler_timeout: Duration::from_secs(30),
            dedup_window: 1024,
        }
    }
}

/// Bounded set of recently seen ids, oldest evicted first
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the id was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        if self.seen.remove(id) {
            self.order.retain(|x| x != id);
            true
        } else {
            false
        }
    }
}

/// Drives one agent's behavior from its mailbox
pub struct AgentWorker {
    ctx: AgentContext,
    behavior: Arc<dyn AgentBehavior>,
    mailbox: MailboxReceiver,
    heartbeat: Arc<dyn HeartbeatSink>,
    config: WorkerConfig,
    cancel: CancellationToken,
    seen: RecentIds,
    cancelled: RecentIds,
    backlog: VecDeque<Message>,
    mailbox_closed: bool,
}

impl AgentWorker {
    pub fn new(
        ctx: AgentContext,
        behavior: Arc<dyn AgentBehavior>,
        mailbox: MailboxReceiver,
        heartbeat: Arc<dyn HeartbeatSink>,
        config: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let window = config.dedup_window;
        Self {
            ctx,
            behavior,
            mailbox,
            heartbeat,
            config,
            cancel,
            seen: RecentIds::new(window),
            cancelled: RecentIds::new(window),
            backlog: VecDeque::new(),
            mailbox_closed: false,
        }
    }

    /// Run until cancelled or the mailbox is closed and drained
    pub async fn run(mut self) {
        let agent_id = self.ctx.agent_id().clone();
        info!("Agent {} running ({})", agent_id, self.behavior.name());

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let message = match self.backlog.pop_front() {
                Some(message) => message,
                None if self.mailbox_closed => break,
                None => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            self.heartbeat.beat(&agent_id);
                            continue;
                        }
                        next = self.mailbox.dequeue() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    }
                }
            };

            if !self.process(message, &mut ticker).await {
                break;
            }
        }

        info!("Agent {} receive loop stopped", agent_id);
    }

    /// Returns false when the loop should stop
    async fn process(&mut self, message: Message, ticker: &mut Interval) -> bool {
        if !self.seen.insert(message.id().as_str()) {
            debug!("Agent {} skipping duplicate {}", self.ctx.agent_id(), message.id());
            return true;
        }

        if let Some(task_id) = cancel_target(&message) {
            debug!("Agent {} marking {} cancelled", self.ctx.agent_id(), task_id);
            self.cancelled.insert(&task_id);
            return true;
        }

        if self.cancelled.remove(message.id().as_str()) {
            self.reply(&message, TaskReply::error("cancelled"));
            return true;
        }

        let task_id = message.id().to_string();
        let agent_id = self.ctx.agent_id().clone();

        let outcome = {
            let handler = tokio::time::timeout(
                self.config.handler_timeout,
                self.behavior.handle(&self.ctx, &message),
            );
            tokio::pin!(handler);

            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return false,
                    result = &mut handler => {
                        break match result {
                            Ok(Ok(value)) => TaskReply::ok(value),
                            Ok(Err(e)) => TaskReply::error(e.to_string()),
                            Err(_) => TaskReply::error("handler timed out"),
                        };
                    }
                    _ = ticker.tick() => self.heartbeat.beat(&agent_id),
                    incoming = self.mailbox.dequeue(), if !self.mailbox_closed => match incoming {
                        Some(next) if cancel_target(&next).as_deref() == Some(task_id.as_str()) => {
                            self.seen.insert(next.id().as_str());
                            break TaskReply::error("cancelled");
                        }
                        Some(next) => self.backlog.push_back(next),
                        None => self.mailbox_closed = true,
                    },
                }
            }
        };

        if let TaskReply::Error { message: reason } = &outcome {
            warn!("Agent {} failed {}: {}", agent_id, task_id, reason);
        }
        self.reply(&message, outcome);
        true
    }

    fn reply(&self, request: &Message, outcome: TaskReply) {
        if request.kind() != MessageKind::Request {
            return;
        }
        let reply = outcome.into_reply(request, self.ctx.agent_id().clone());
        if let Err(e) = self.ctx.bus().publish(reply) {
            debug!("Agent {} could not reply to {}: {}", self.ctx.agent_id(), request.id(), e);
        }
    }
}
