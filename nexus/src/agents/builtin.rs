//! Built-in behaviors and the default launcher
//!
//! - `echo`: replies with the payload, or with a canned reply from
//!   `settings.replies` when the payload is a matching string
//! - `log`: records every message at info level and replies `null`
//! - `delay`: waits `settings.delay_ms` before echoing

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{AgentBehavior, AgentContext, AgentError, AgentLauncher, AgentSpec, Result};
use crate::coordination::Message;

type BehaviorFactory = Arc<dyn Fn(&AgentSpec) -> Result<Arc<dyn AgentBehavior>> + Send + Sync>;

/// Replies with the payload or a canned answer
#[derive(Debug, Default)]
pub struct EchoBehavior {
    replies: HashMap<String, serde_json::Value>,
}

impl EchoBehavior {
    pub fn from_spec(spec: &AgentSpec) -> Result<Self> {
        let replies = match spec.settings.get("replies") {
            None => HashMap::new(),
            Some(replies) => {
                serde_json::from_value(replies.clone()).map_err(|e| AgentError::InvalidSettings {
                    agent_id: spec.id.to_string(),
                    reason: format!("replies: {e}"),
                })?
            }
        };
        Ok(Self { replies })
    }

    fn answer(&self, payload: &serde_json::Value) -> serde_json::Value {
        payload
            .as_str()
            .and_then(|key| self.replies.get(key))
            .cloned()
            .unwrap_or_else(|| payload.clone())
    }
}

#[async_trait]
impl AgentBehavior for EchoBehavior {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(&self, _ctx: &AgentContext, message: &Message) -> Result<serde_json::Value> {
        Ok(self.answer(message.payload()))
    }
}

/// Sink that logs what it receives
#[derive(Debug, Default)]
pub struct LogBehavior;

#[async_trait]
impl AgentBehavior for LogBehavior {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, ctx: &AgentContext, message: &Message) -> Result<serde_json::Value> {
        info!(
            agent = %ctx.agent_id(),
            message_id = %message.id(),
            sender = %message.sender(),
            topic = message.topic().unwrap_or("-"),
            "{}",
            message.payload()
        );
        Ok(serde_json::Value::Null)
    }
}

/// Echo after a fixed delay
#[derive(Debug)]
pub struct DelayBehavior {
    delay: Duration,
}

impl DelayBehavior {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_spec(spec: &AgentSpec) -> Result<Self> {
        let delay_ms = spec
            .settings
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AgentError::InvalidSettings {
                agent_id: spec.id.to_string(),
                reason: "delay_ms must be a non-negative integer".to_string(),
            })?;
        Ok(Self::new(Duration::from_millis(delay_ms)))
    }
}

#[async_trait]
impl AgentBehavior for DelayBehavior {
    fn name(&self) -> &str {
        "delay"
    }

    async fn handle(&self, _ctx: &AgentContext, message: &Message) -> Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        Ok(message.payload().clone())
    }
}

/// Launcher resolving `AgentSpec::behavior` by name
pub struct BuiltinLauncher {
    factories: RwLock<HashMap<String, BehaviorFactory>>,
}

impl BuiltinLauncher {
    pub fn new() -> Self {
        let launcher = Self {
            factories: RwLock::new(HashMap::new()),
        };
        launcher.register("echo", |spec| Ok(Arc::new(EchoBehavior::from_spec(spec)?)));
        launcher.register("log", |_| Ok(Arc::new(LogBehavior)));
        launcher.register("delay", |spec| Ok(Arc::new(DelayBehavior::from_spec(spec)?)));
        launcher
    }

    /// Add or replace a named behavior
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AgentSpec) -> Result<Arc<dyn AgentBehavior>> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn behaviors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BuiltinLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLauncher for BuiltinLauncher {
    fn launch(&self, spec: &AgentSpec) -> Result<Arc<dyn AgentBehavior>> {
        let factory = self
            .factories
            .read()
            .get(&spec.behavior)
            .cloned()
            .ok_or_else(|| AgentError::UnknownBehavior(spec.behavior.clone()))?;
        factory(spec)
    }
}
