//! Topic Router - subscription index and topic resolution
//!
//! Topics are dot-separated segments. Subscription patterns may use `*` to
//! match exactly one segment and a trailing `**` to match one or more
//! remaining segments. Matching is case-sensitive.
//!
//! The index is copy-on-write: every dispatch decision works on an immutable
//! [`RouterSnapshot`], so concurrent subscribe/unsubscribe calls never leave a
//! single decision half-updated.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::{BusError, Result};
use crate::agents::AgentId;

const SEGMENT_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = "**";

/// Validated subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Parse and validate a pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(BusError::InvalidTopic {
                topic: pattern.to_string(),
                reason: "empty topic".to_string(),
            });
        }

        let segments: Vec<&str> = pattern.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(BusError::InvalidTopic {
                    topic: pattern.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            if *segment == TAIL_WILDCARD && i + 1 != segments.len() {
                return Err(BusError::InvalidTopic {
                    topic: pattern.to_string(),
                    reason: "'**' is only allowed as the last segment".to_string(),
                });
            }
            if *segment != SEGMENT_WILDCARD && *segment != TAIL_WILDCARD && segment.contains('*') {
                return Err(BusError::InvalidTopic {
                    topic: pattern.to_string(),
                    reason: "wildcards must span a whole segment".to_string(),
                });
            }
        }

        Ok(Self(pattern.to_string()))
    }

    /// True when the pattern has no wildcard segment
    pub fn is_exact(&self) -> bool {
        !self.0.split('.').any(|s| s == SEGMENT_WILDCARD || s == TAIL_WILDCARD)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Match a concrete topic against this pattern
    pub fn matches(&self, topic: &str) -> bool {
        let mut pattern = self.0.split('.');
        let mut topic = topic.split('.');

        loop {
            match (pattern.next(), topic.next()) {
                (Some(TAIL_WILDCARD), Some(segment)) => return !segment.is_empty(),
                (Some(SEGMENT_WILDCARD), Some(segment)) if !segment.is_empty() => {}
                (Some(p), Some(t)) if p == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.0
    }
}

/// Validate a topic used for publishing: no wildcards, no empty segments
pub fn validate_publish_topic(topic: &str) -> Result<()> {
    let pattern = TopicPattern::parse(topic)?;
    if !pattern.is_exact() {
        return Err(BusError::InvalidTopic {
            topic: topic.to_string(),
            reason: "published topics must be concrete".to_string(),
        });
    }
    Ok(())
}

/// Immutable view of the subscription index
#[derive(Debug, Clone, Default)]
pub struct RouterSnapshot {
    by_agent: BTreeMap<AgentId, BTreeSet<TopicPattern>>,
    exact: HashMap<String, BTreeSet<AgentId>>,
    wildcard: BTreeMap<TopicPattern, BTreeSet<AgentId>>,
}

impl RouterSnapshot {
    /// Agents whose subscriptions match `topic`, in deterministic order
    pub fn match_topic(&self, topic: &str) -> BTreeSet<AgentId> {
        let mut agents = self.exact.get(topic).cloned().unwrap_or_default();

        for (pattern, subscribers) in &self.wildcard {
            if pattern.matches(topic) {
                agents.extend(subscribers.iter().cloned());
            }
        }

        agents
    }

    pub fn subscriptions_of(&self, agent_id: &AgentId) -> BTreeSet<TopicPattern> {
        self.by_agent.get(agent_id).cloned().unwrap_or_default()
    }

    /// Number of agents with at least one subscription
    pub fn subscriber_count(&self) -> usize {
        self.by_agent.len()
    }

    fn insert(&mut self, agent_id: &AgentId, pattern: &TopicPattern) -> bool {
        let added = self
            .by_agent
            .entry(agent_id.clone())
            .or_default()
            .insert(pattern.clone());

        if added {
            if pattern.is_exact() {
                self.exact
                    .entry(pattern.as_str().to_string())
                    .or_default()
                    .insert(agent_id.clone());
            } else {
                self.wildcard
                    .entry(pattern.clone())
                    .or_default()
                    .insert(agent_id.clone());
            }
        }

        added
    }

    fn remove(&mut self, agent_id: &AgentId, pattern: &TopicPattern) -> bool {
        let removed = match self.by_agent.get_mut(agent_id) {
            Some(patterns) => {
                let removed = patterns.remove(pattern);
                if patterns.is_empty() {
                    self.by_agent.remove(agent_id);
                }
                removed
            }
            None => false,
        };

        if removed {
            if pattern.is_exact() {
                if let Some(agents) = self.exact.get_mut(pattern.as_str()) {
                    agents.remove(agent_id);
                    if agents.is_empty() {
                        self.exact.remove(pattern.as_str());
                    }
                }
            } else if let Some(agents) = self.wildcard.get_mut(pattern) {
                agents.remove(agent_id);
                if agents.is_empty() {
                    self.wildcard.remove(pattern);
                }
            }
        }

        removed
    }
}

/// Subscription index shared by the bus
#[derive(Debug, Default)]
pub struct TopicRouter {
    snapshot: RwLock<Arc<RouterSnapshot>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current consistent view of all subscriptions
    pub fn snapshot(&self) -> Arc<RouterSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn match_topic(&self, topic: &str) -> BTreeSet<AgentId> {
        self.snapshot().match_topic(topic)
    }

    /// Add a subscription. Returns false if it already existed.
    pub fn subscribe(&self, agent_id: &AgentId, pattern: &TopicPattern) -> bool {
        let mut guard = self.snapshot.write();
        Arc::make_mut(&mut guard).insert(agent_id, pattern)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, agent_id: &AgentId, pattern: &TopicPattern) -> bool {
        let mut guard = self.snapshot.write();
        Arc::make_mut(&mut guard).remove(agent_id, pattern)
    }

    /// Drop every subscription of an agent, returning what it had
    pub fn remove_agent(&self, agent_id: &AgentId) -> BTreeSet<TopicPattern> {
        let mut guard = self.snapshot.write();
        let snapshot = Arc::make_mut(&mut guard);
        let patterns = snapshot.subscriptions_of(agent_id);
        for pattern in &patterns {
            snapshot.remove(agent_id, pattern);
        }
        patterns
    }

    pub fn subscriptions_of(&self, agent_id: &AgentId) -> BTreeSet<TopicPattern> {
        self.snapshot.read().subscriptions_of(agent_id)
    }
}
