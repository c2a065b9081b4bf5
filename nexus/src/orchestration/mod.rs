//! Agent orchestration
//!
//! Registration, lifecycle and health of agents attached to the bus, plus
//! task submission carried as messages over it.

pub mod orchestrator;
pub mod task_bridge;
pub mod tasks;

pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, Registration, UnregisterPolicy};
pub use task_bridge::{BRIDGE_TOPIC, TaskBridge, TaskHandoff, queue_for};
pub use tasks::{TaskRecord, TaskStatus};

use crate::agents::{AgentError, AgentStatus};
use crate::coordination::BusError;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid transition for {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("Invalid mailbox capacity {capacity} for agent {agent_id}")]
    InvalidCapacity { agent_id: String, capacity: usize },

    #[error("Agent crashed: {0}")]
    AgentCrashed(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Launch failed: {0}")]
    Launch(#[from] AgentError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
