//! Message envelope carried by the bus
//!
//! A [`Message`] is an immutable value once built: fields are private and only
//! the bus itself stamps `created_at`, bumps `delivery_attempts` on retries and
//! fills in correlation data for request/response calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::agents::AgentId;

/// Unique message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier linking a response to its originating request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&MessageId> for CorrelationId {
    fn from(id: &MessageId) -> Self {
        Self(id.0.clone())
    }
}

/// Priority tier, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers in dispatch order
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Queue index, 0 is dispatched first
    pub fn tier(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" | "default" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// What a message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    #[default]
    Event,
    Broadcast,
}

/// One unit of communication on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    correlation_id: Option<CorrelationId>,
    kind: MessageKind,
    topic: Option<String>,
    sender: AgentId,
    recipient: Option<AgentId>,
    priority: Priority,
    payload: serde_json::Value,
    created_at: Option<DateTime<Utc>>,
    delivery_attempts: u32,
    #[serde(default, with = "ttl_millis")]
    ttl: Option<Duration>,
    #[serde(default)]
    confirm_delivery: bool,
    /// Set on a RESPONSE whose request failed; the payload is then null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Message {
    /// Start building a message from `sender`
    pub fn builder(sender: impl Into<AgentId>) -> MessageBuilder {
        MessageBuilder::new(sender.into())
    }

    /// Event published to a topic
    pub fn to_topic(
        sender: impl Into<AgentId>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::builder(sender).topic(topic).payload(payload).build()
    }

    /// Event addressed to a single agent
    pub fn direct(
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        payload: serde_json::Value,
    ) -> Self {
        Self::builder(sender).recipient(recipient).payload(payload).build()
    }

    /// Build the response to this message, addressed back to its sender.
    ///
    /// The response carries this message's correlation id, or its id when the
    /// request had none.
    pub fn reply(&self, sender: impl Into<AgentId>, payload: serde_json::Value) -> Self {
        self.reply_builder(sender.into()).payload(payload).build()
    }

    /// Build a failed response: null payload with the reason in
    /// [`Message::error`]
    pub fn reply_error(&self, sender: impl Into<AgentId>, reason: impl Into<String>) -> Self {
        self.reply_builder(sender.into()).error(reason).build()
    }

    fn reply_builder(&self, sender: AgentId) -> MessageBuilder {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| CorrelationId::from(&self.id));

        Self::builder(sender)
            .kind(MessageKind::Response)
            .recipient(self.sender.clone())
            .correlation_id(correlation_id)
            .priority(self.priority)
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn sender(&self) -> &AgentId {
        &self.sender
    }

    pub fn recipient(&self) -> Option<&AgentId> {
        self.recipient.as_ref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn delivery_attempts(&self) -> u32 {
        self.delivery_attempts
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn confirm_delivery(&self) -> bool {
        self.confirm_delivery
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether this message can settle a pending request: it carries a
    /// correlation id and is not itself a request
    pub fn answers_correlation(&self) -> bool {
        self.correlation_id.is_some() && self.kind != MessageKind::Request
    }

    /// Whether the ttl has elapsed at `now`. Messages without ttl or
    /// without a creation stamp never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.created_at, self.ttl) {
            (Some(created_at), Some(ttl)) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => created_at + ttl <= now,
                Err(_) => false,
            },
            _ => false,
        }
    }

    pub(crate) fn stamp(&mut self, now: DateTime<Utc>, default_ttl: Option<Duration>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        if self.ttl.is_none() {
            self.ttl = default_ttl;
        }
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.delivery_attempts += 1;
        self.delivery_attempts
    }

    /// Turn this message into a correlated request, returning the
    /// correlation id the reply must carry.
    pub(crate) fn prepare_request(&mut self) -> CorrelationId {
        if self.kind != MessageKind::Response {
            self.kind = MessageKind::Request;
        }
        let id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| CorrelationId::from(&self.id));
        self.correlation_id = Some(id.clone());
        id
    }
}

/// Builder for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    fn new(sender: AgentId) -> Self {
        Self {
            message: Message {
                id: MessageId::new(),
                correlation_id: None,
                kind: MessageKind::default(),
                topic: None,
                sender,
                recipient: None,
                priority: Priority::default(),
                payload: serde_json::Value::Null,
                created_at: None,
                delivery_attempts: 0,
                ttl: None,
                confirm_delivery: false,
                error: None,
            },
        }
    }

    pub fn id(mut self, id: MessageId) -> Self {
        self.message.id = id;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.message.topic = Some(topic.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<AgentId>) -> Self {
        self.message.recipient = Some(recipient.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.message.correlation_id = Some(id.into());
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.message.kind = kind;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.message.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.message.payload = payload;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.message.ttl = Some(ttl);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.message.created_at = Some(created_at);
        self
    }

    /// Ask the bus to notify the sender if delivery is exhausted
    pub fn confirm_delivery(mut self) -> Self {
        self.message.confirm_delivery = true;
        self
    }

    /// Mark the message as a failed reply
    pub fn error(mut self, reason: impl Into<String>) -> Self {
        self.message.error = Some(reason.into());
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        ttl: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_some(&(ttl.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_tiers_are_ordered() {
        let tiers: Vec<usize> = Priority::ALL.iter().map(|p| p.tier()).collect();
        assert_eq!(tiers, vec![0, 1, 2, 3]);
        assert_eq!("default".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let msg = Message::to_topic("caller", "agents.solomon", json!("ping"));

        assert_eq!(msg.kind(), MessageKind::Event);
        assert_eq!(msg.priority(), Priority::Normal);
        assert_eq!(msg.delivery_attempts(), 0);
        assert!(msg.created_at().is_none());
        assert!(msg.recipient().is_none());
        assert_eq!(msg.topic(), Some("agents.solomon"));
    }

    #[test]
    fn test_reply_inherits_correlation() {
        let request = Message::builder("caller")
            .topic("agents.solomon")
            .correlation_id("c1")
            .payload(json!("ping"))
            .build();

        let reply = request.reply("solomon", json!("pong"));
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.recipient(), Some(&AgentId::from("caller")));
        assert_eq!(reply.correlation_id(), Some(&CorrelationId::from("c1")));
        assert_eq!(reply.sender(), &AgentId::from("solomon"));
    }

    #[test]
    fn test_reply_falls_back_to_request_id() {
        let request = Message::direct("caller", "worker", json!({}));
        let reply = request.reply("worker", json!(null));
        assert_eq!(reply.correlation_id(), Some(&CorrelationId::from(request.id())));
    }

    #[test]
    fn test_reply_error_keeps_payload_clear() {
        let request = Message::direct("caller", "worker", json!("task"));
        let ok = request.reply("worker", json!("pong"));
        assert_eq!(ok.payload(), &json!("pong"));
        assert_eq!(ok.error(), None);

        let failed = request.reply_error("worker", "boom");
        assert_eq!(failed.payload(), &json!(null));
        assert_eq!(failed.error(), Some("boom"));
        assert_eq!(failed.kind(), MessageKind::Response);
    }

    #[test]
    fn test_any_correlated_non_request_answers() {
        let event_reply = Message::builder("solomon")
            .recipient("caller")
            .correlation_id("c1")
            .payload(json!("pong"))
            .build();
        assert_eq!(event_reply.kind(), MessageKind::Event);
        assert!(event_reply.answers_correlation());

        let request = Message::builder("caller")
            .kind(MessageKind::Request)
            .correlation_id("c1")
            .build();
        assert!(!request.answers_correlation());
        assert!(!Message::direct("a", "b", json!(1)).answers_correlation());
    }

    #[test]
    fn test_prepare_request_keeps_explicit_correlation() {
        let mut msg = Message::builder("caller")
            .recipient("worker")
            .correlation_id("c1")
            .build();

        let id = msg.prepare_request();
        assert_eq!(id, CorrelationId::from("c1"));
        assert_eq!(msg.kind(), MessageKind::Request);
    }

    #[test]
    fn test_ttl_expiry() {
        let now = Utc::now();
        let mut msg = Message::builder("caller")
            .topic("t")
            .ttl(Duration::from_millis(100))
            .build();
        assert!(!msg.is_expired(now));

        msg.stamp(now - chrono::Duration::milliseconds(200), None);
        assert!(msg.is_expired(now));
    }

    #[test]
    fn test_ttl_serializes_as_millis() {
        let msg = Message::builder("caller")
            .topic("t")
            .ttl(Duration::from_secs(2))
            .build();

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["ttl"], json!(2000));

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.ttl(), Some(Duration::from_secs(2)));
    }
}
