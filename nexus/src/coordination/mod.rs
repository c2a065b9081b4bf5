//! Inter-agent messaging
//!
//! Priority-aware, topic-routed message bus with per-agent bounded mailboxes,
//! request/response correlation, retry with backoff and a durable message
//! history.

pub mod correlation;
pub mod durable_log;
pub mod mailbox;
pub mod message;
pub mod message_bus;
pub mod priority_queue;
pub mod system_events;
pub mod topic_router;

pub use correlation::{CorrelationTracker, Waiter};
pub use durable_log::{
    DurableLog, InMemoryLog, LogError, LogFilter, LogOutcome, LogRecord, RetentionPolicy,
};
#[cfg(feature = "sqlite")]
pub use durable_log::SqliteLog;
pub use mailbox::{BackpressurePolicy, Mailbox, MailboxReceiver, mailbox};
pub use message::{CorrelationId, Message, MessageBuilder, MessageId, MessageKind, Priority};
pub use message_bus::{DeadLetter, MessageBus, MessageBusConfig, PendingReply, PublishReceipt};
pub use priority_queue::PriorityQueueSet;
pub use system_events::{DELIVERY_TOPIC, LIFECYCLE_TOPIC, SystemEvent, is_system_topic};
pub use topic_router::{RouterSnapshot, TopicPattern, TopicRouter};

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Bus is closed")]
    BusClosed,

    #[error("Delivery of {message_id} to {recipient} exhausted after {attempts} attempts")]
    DeliveryExhausted {
        message_id: String,
        recipient: String,
        attempts: u32,
    },

    #[error("No response for correlation {correlation_id} before deadline")]
    CorrelationTimeout { correlation_id: String },

    #[error("Correlation {correlation_id} already has a pending waiter")]
    DuplicateCorrelation { correlation_id: String },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already attached: {0}")]
    AgentAlreadyAttached(String),

    #[error("Invalid mailbox capacity {capacity} for agent {agent_id}")]
    InvalidCapacity { agent_id: String, capacity: usize },

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Mailbox of {agent_id} is closed")]
    MailboxClosed { agent_id: String },

    #[error(transparent)]
    Log(#[from] LogError),
}
