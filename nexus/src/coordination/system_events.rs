//! Reserved system topics and the events published on them

use serde::{Deserialize, Serialize};

use super::message::{CorrelationId, Message, MessageId, MessageKind, Priority};
use crate::agents::{AgentId, AgentStatus, ThrottleReason};

/// Orchestrator lifecycle events
pub const LIFECYCLE_TOPIC: &str = "system.lifecycle";

/// Bus delivery failures and correlation timeouts
pub const DELIVERY_TOPIC: &str = "system.delivery";

const SYSTEM_PREFIX: &str = "system.";

/// Whether a topic is reserved for system events
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with(SYSTEM_PREFIX)
}

/// Event payloads, tagged by `event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    AgentRegistered {
        agent_id: AgentId,
        topics: Vec<String>,
        restart_count: u32,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentThrottled {
        agent_id: AgentId,
        reason: ThrottleReason,
    },
    AgentCrashed {
        agent_id: AgentId,
        reason: String,
        restart_count: u32,
    },
    AgentRestarted {
        agent_id: AgentId,
        restart_count: u32,
    },
    RestartBudgetExhausted {
        agent_id: AgentId,
        restarts: u32,
    },
    AgentUnregistered {
        agent_id: AgentId,
        discarded: usize,
    },
    DeliveryExhausted {
        message_id: MessageId,
        correlation_id: Option<CorrelationId>,
        sender: AgentId,
        recipient: AgentId,
        topic: Option<String>,
        attempts: u32,
    },
    CorrelationTimeout {
        correlation_id: CorrelationId,
    },
}

impl SystemEvent {
    /// Topic the event is published on
    pub fn topic(&self) -> &'static str {
        match self {
            SystemEvent::DeliveryExhausted { .. } | SystemEvent::CorrelationTimeout { .. } => {
                DELIVERY_TOPIC
            }
            _ => LIFECYCLE_TOPIC,
        }
    }

    fn priority(&self) -> Priority {
        match self {
            SystemEvent::AgentCrashed { .. }
            | SystemEvent::RestartBudgetExhausted { .. }
            | SystemEvent::DeliveryExhausted { .. } => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Broadcast message on the event's system topic
    pub fn into_message(self) -> Message {
        Message::builder(AgentId::system())
            .kind(MessageKind::Broadcast)
            .topic(self.topic())
            .priority(self.priority())
            .payload(self.to_payload())
            .build()
    }

    /// Same event addressed directly to one agent
    pub fn direct_to(&self, recipient: AgentId) -> Message {
        Message::builder(AgentId::system())
            .kind(MessageKind::Event)
            .recipient(recipient)
            .priority(self.priority())
            .payload(self.to_payload())
            .build()
    }

    /// Parse an event back out of a system message payload
    pub fn from_message(message: &Message) -> Option<Self> {
        serde_json::from_value(message.payload().clone()).ok()
    }
}
