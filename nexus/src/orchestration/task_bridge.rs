//! Hand-off of work to an external task queue
//!
//! The bus does not talk to the queue itself. A [`TaskHandoff`] is published
//! fire-and-forget on `bridge.tasks`, where a bridge consumer picks it up.

use serde::{Deserialize, Serialize};

use crate::agents::AgentId;
use crate::coordination::{Message, MessageBus, MessageKind, Priority, PublishReceipt, Result};

pub const BRIDGE_TOPIC: &str = "bridge.tasks";

/// Queue name used for a priority tier
pub fn queue_for(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "critical",
        Priority::High => "high",
        Priority::Normal => "default",
        Priority::Low => "low",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHandoff {
    pub task_name: String,
    pub args: serde_json::Value,
    pub priority: Priority,
    pub queue: String,
}

impl TaskHandoff {
    pub fn new(task_name: impl Into<String>, args: serde_json::Value, priority: Priority) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            priority,
            queue: queue_for(priority).to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskBridge {
    bus: MessageBus,
    sender: AgentId,
}

impl TaskBridge {
    pub fn new(bus: MessageBus, sender: AgentId) -> Self {
        Self { bus, sender }
    }

    pub fn handoff(
        &self,
        task_name: impl Into<String>,
        args: serde_json::Value,
        priority: Priority,
    ) -> Result<PublishReceipt> {
        let handoff = TaskHandoff::new(task_name, args, priority);
        let payload = serde_json::to_value(&handoff)
            .map_err(|e| crate::coordination::BusError::InvalidMessage(e.to_string()))?;

        let message = Message::builder(self.sender.clone())
            .kind(MessageKind::Event)
            .topic(BRIDGE_TOPIC)
            .priority(priority)
            .payload(payload)
            .build();

        self.bus.publish(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_names() {
        assert_eq!(queue_for(Priority::Critical), "critical");
        assert_eq!(queue_for(Priority::Normal), "default");
        assert_eq!(queue_for(Priority::Low), "low");
    }

    #[test]
    fn test_handoff_payload() {
        let handoff = TaskHandoff::new("reports.generate", json!({"month": 3}), Priority::High);
        assert_eq!(
            serde_json::to_value(&handoff).unwrap(),
            json!({
                "task_name": "reports.generate",
                "args": {"month": 3},
                "priority": "high",
                "queue": "high",
            })
        );
    }
}
