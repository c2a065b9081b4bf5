//! Core Agent Types and Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::lifecycle::{AgentStatus, ThrottleReason};
use crate::coordination::TopicPattern;

/// Unique identifier for an agent or external caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new unique agent ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string (for configuration/testing)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// System agent ID used as sender of bus and orchestrator events
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Snapshot of an agent's registration record as held by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub subscribed_topics: BTreeSet<TopicPattern>,
    pub mailbox_capacity: usize,
    pub status: AgentStatus,
    pub throttle_reason: Option<ThrottleReason>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub restart_count: u32,
}

impl AgentRegistration {
    /// Whether the agent currently counts as live for duplicate detection
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// Declarative description of an agent the orchestrator can launch
///
/// `behavior` names the strategy an [`AgentLauncher`](super::AgentLauncher)
/// uses to construct the agent's runtime behavior; `settings` is passed
/// through to it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,

    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    pub behavior: String,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

fn default_mailbox_capacity() -> usize {
    256
}

impl AgentSpec {
    /// Create a spec with default capacity and no settings
    pub fn new(id: impl Into<AgentId>, behavior: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topics: Vec::new(),
            mailbox_capacity: default_mailbox_capacity(),
            behavior: behavior.into(),
            settings: serde_json::Value::Null,
        }
    }

    /// Add a subscription pattern
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Override the mailbox capacity
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Attach behavior-specific settings
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id() {
        let id1 = AgentId::new();
        let id2 = AgentId::new();
        assert_ne!(id1, id2);

        let system_id = AgentId::system();
        assert_eq!(system_id.to_string(), "system");
        assert_eq!(AgentId::from("solomon").as_str(), "solomon");
    }

    #[test]
    fn test_agent_spec_from_toml() {
        let spec: AgentSpec = toml::from_str(
            r#"
            id = "solomon"
            topics = ["agents.solomon"]
            behavior = "echo"
            "#,
        )
        .unwrap();

        assert_eq!(spec.id, AgentId::from("solomon"));
        assert_eq!(spec.mailbox_capacity, 256);
        assert_eq!(spec.topics, vec!["agents.solomon".to_string()]);
        assert!(spec.settings.is_null());
    }
}
