//! Agents attached to the bus
//!
//! The bus only ever sees agent ids, subscriptions and opaque payloads. What
//! an agent actually does is an [`AgentBehavior`], produced from an
//! [`AgentSpec`] by a pluggable [`AgentLauncher`] and driven by the receive
//! loop in [`worker`].

use async_trait::async_trait;
use std::sync::Arc;

pub mod builtin;
pub mod lifecycle;
pub mod types;
pub mod worker;

pub use builtin::BuiltinLauncher;
pub use lifecycle::{AgentStatus, ThrottleReason};
pub use types::{AgentId, AgentRegistration, AgentSpec};
pub use worker::{AgentContext, AgentWorker, HeartbeatSink, TaskReply, WorkerConfig};

use crate::coordination::{BusError, Message};

/// Runtime behavior of an agent
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Handle one message. For REQUEST messages the value becomes the
    /// result of the reply.
    async fn handle(&self, ctx: &AgentContext, message: &Message) -> Result<serde_json::Value>;
}

/// Strategy the orchestrator consults to turn a spec into a behavior
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, spec: &AgentSpec) -> Result<Arc<dyn AgentBehavior>>;
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown behavior: {0}")]
    UnknownBehavior(String),

    #[error("Invalid settings for {agent_id}: {reason}")]
    InvalidSettings { agent_id: String, reason: String },

    #[error("Task execution failed: {0}")]
    TaskFailed(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
