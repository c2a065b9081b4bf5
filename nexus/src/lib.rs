//! Nexus - message bus and agent orchestrator for multi-agent systems
//!
//! Agents exchange messages through a priority-aware, topic-routed bus with
//! bounded per-agent mailboxes, request/response correlation and a durable
//! message history. The orchestrator registers agents, watches their
//! heartbeats and restarts them when they crash.
//!
//! # Architecture
//!
//! - `coordination` - message model, topic router, mailboxes, correlation
//!   tracking, durable log and the [`MessageBus`] itself
//! - `agents` - agent identity, lifecycle states, behaviors and the receive
//!   loop that drives them
//! - `orchestration` - the [`AgentOrchestrator`], task records and the
//!   external task-queue bridge
//! - `monitoring` - bus counters
//! - `config` - TOML configuration with environment overrides
//!
//! # Example
//!
//! ```no_run
//! use nexus::{
//!     AgentOrchestrator, AgentSpec, BuiltinLauncher, MessageBus, MessageBusConfig,
//!     OrchestratorConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = MessageBus::in_memory(MessageBusConfig::default());
//! bus.start();
//!
//! let orchestrator = AgentOrchestrator::new(
//!     bus.clone(),
//!     Arc::new(BuiltinLauncher::new()),
//!     OrchestratorConfig::default(),
//! );
//! orchestrator.start();
//! orchestrator.spawn_agent(
//!     AgentSpec::new("solomon", "echo")
//!         .with_settings(serde_json::json!({"replies": {"ping": "pong"}})),
//! )?;
//!
//! let task = orchestrator.submit_task(&"solomon".into(), serde_json::json!("ping"))?;
//! # let _ = task;
//! orchestrator.shutdown().await;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod config;
pub mod coordination;
pub mod monitoring;
pub mod orchestration;

pub use agents::{AgentBehavior, AgentId, AgentLauncher, AgentSpec, AgentStatus, BuiltinLauncher};
pub use config::NexusConfig;
pub use coordination::{
    BusError, LogFilter, LogOutcome, Message, MessageBus, MessageBusConfig, MessageKind, Priority,
    SystemEvent,
};
pub use orchestration::{AgentOrchestrator, OrchestratorConfig, OrchestratorError, TaskStatus};

/// Nexus version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
