//! Configuration for the nexus runtime.
//!
//! Settings live in a single TOML file:
//!
//! ```toml
//! [bus]
//! max_delivery_attempts = 3
//! backpressure = "reject-new"
//!
//! [orchestrator]
//! heartbeat_timeout_ms = 5000
//!
//! [log]
//! backend = "memory"
//!
//! [logging]
//! level = "info"
//!
//! [[agents]]
//! id = "solomon"
//! behavior = "echo"
//! topics = ["agents.solomon"]
//! ```
//!
//! # Configuration Location
//!
//! `--config` on the command line wins, then `NEXUS_CONFIG_PATH`, then
//! `~/.nexus/config.toml`. A missing default file yields the defaults.
//! Environment variables prefixed with `NEXUS_` override file values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::agents::AgentSpec;
use crate::coordination::{
    BackpressurePolicy, DurableLog, InMemoryLog, LogError, MessageBusConfig, RetentionPolicy,
    TopicPattern,
};
use crate::orchestration::{OrchestratorConfig, UnregisterPolicy};

/// Environment variable prefix for all overrides
pub const ENV_PREFIX: &str = "NEXUS_";

pub const ENV_CONFIG_PATH: &str = "NEXUS_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "NEXUS_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "NEXUS_LOG_FORMAT";
pub const ENV_MAX_DELIVERY_ATTEMPTS: &str = "NEXUS_MAX_DELIVERY_ATTEMPTS";
pub const ENV_BACKPRESSURE: &str = "NEXUS_BACKPRESSURE";
pub const ENV_DEFAULT_TTL_MS: &str = "NEXUS_DEFAULT_TTL_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "NEXUS_HEARTBEAT_TIMEOUT_MS";
pub const ENV_MAX_RESTART_ATTEMPTS: &str = "NEXUS_MAX_RESTART_ATTEMPTS";
pub const ENV_LOG_BACKEND: &str = "NEXUS_LOG_BACKEND";
pub const ENV_LOG_PATH: &str = "NEXUS_LOG_PATH";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidEnv { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NexusConfig {
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub logging: LoggingSection,
    /// Agents launched by `nexus run`
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// `[bus]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backpressure: BackpressurePolicy,
    pub block_timeout_ms: u64,
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
    pub max_dead_letters: usize,
    pub log_buffer: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        let defaults = MessageBusConfig::default();
        Self {
            max_delivery_attempts: defaults.max_delivery_attempts,
            retry_base_delay_ms: millis(defaults.retry_base_delay),
            retry_max_delay_ms: millis(defaults.retry_max_delay),
            backpressure: defaults.backpressure,
            block_timeout_ms: millis(defaults.block_timeout),
            default_ttl_ms: defaults.default_ttl.map(millis),
            sweep_interval_ms: millis(defaults.sweep_interval),
            max_dead_letters: defaults.max_dead_letters,
            log_buffer: defaults.log_buffer,
        }
    }
}

impl BusSection {
    pub fn to_bus_config(&self) -> MessageBusConfig {
        MessageBusConfig {
            max_delivery_attempts: self.max_delivery_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backpressure: self.backpressure,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            default_ttl: self.default_ttl_ms.map(Duration::from_millis),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            max_dead_letters: self.max_dead_letters,
            log_buffer: self.log_buffer,
        }
    }
}

/// `[orchestrator]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub heartbeat_interval_ms: u64,
    pub throttle_after_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub liveness_interval_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_backoff_base_ms: u64,
    pub saturation_threshold: f64,
    pub unregister_policy: UnregisterPolicy,
    pub drain_grace_ms: u64,
    pub task_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub max_task_records: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            heartbeat_interval_ms: millis(defaults.heartbeat_interval),
            throttle_after_ms: millis(defaults.throttle_after),
            heartbeat_timeout_ms: millis(defaults.heartbeat_timeout),
            liveness_interval_ms: millis(defaults.liveness_interval),
            max_restart_attempts: defaults.max_restart_attempts,
            restart_backoff_base_ms: millis(defaults.restart_backoff_base),
            saturation_threshold: defaults.saturation_threshold,
            unregister_policy: defaults.unregister_policy,
            drain_grace_ms: millis(defaults.drain_grace),
            task_timeout_ms: millis(defaults.task_timeout),
            handler_timeout_ms: millis(defaults.handler_timeout),
            max_task_records: defaults.max_task_records,
        }
    }
}

impl OrchestratorSection {
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            throttle_after: Duration::from_millis(self.throttle_after_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            max_restart_attempts: self.max_restart_attempts,
            restart_backoff_base: Duration::from_millis(self.restart_backoff_base_ms),
            saturation_threshold: self.saturation_threshold,
            unregister_policy: self.unregister_policy,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            task_timeout: Duration::from_millis(self.task_timeout_ms),
            handler_timeout: Duration::from_millis(self.handler_timeout_ms),
            max_task_records: self.max_task_records,
        }
    }
}

/// Durable log backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for LogBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown log backend '{other}', expected memory or sqlite")),
        }
    }
}

/// `[log]`: where message history is kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub backend: LogBackend,
    /// Database file for the sqlite backend
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl LogSection {
    /// Open the configured backend
    pub async fn open(&self) -> std::result::Result<Arc<dyn DurableLog>, LogError> {
        match self.backend {
            LogBackend::Memory => Ok(Arc::new(InMemoryLog::new(self.retention))),
            LogBackend::Sqlite => self.open_sqlite().await,
        }
    }

    #[cfg(feature = "sqlite")]
    async fn open_sqlite(&self) -> std::result::Result<Arc<dyn DurableLog>, LogError> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| LogError::Backend("sqlite backend requires log.path".to_string()))?;
        let log = crate::coordination::SqliteLog::open(path, self.retention).await?;
        Ok(Arc::new(log))
    }

    #[cfg(not(feature = "sqlite"))]
    async fn open_sqlite(&self) -> std::result::Result<Arc<dyn DurableLog>, LogError> {
        Err(LogError::Backend(
            "sqlite backend requires building with the `sqlite` feature".to_string(),
        ))
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// trace, debug, info, warn or error
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl NexusConfig {
    /// Defaults plus the Solomon echo agent, as written by `nexus config init`
    pub fn sample() -> Self {
        let solomon = AgentSpec::new("solomon", "echo")
            .with_topic("agents.solomon")
            .with_settings(serde_json::json!({ "replies": { "ping": "pong" } }));
        Self {
            agents: vec![solomon],
            ..Self::default()
        }
    }

    /// Default config file location
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".nexus").join("config.toml"))
    }

    /// Load from an explicit path, which must exist
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content)?;

        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given, otherwise from the default location when a
    /// file exists there, otherwise start from defaults
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path).await;
        }

        let default_path = Self::config_path()?;
        if tokio::fs::try_exists(&default_path).await.unwrap_or(false) {
            return Self::load_from_path(&default_path).await;
        }

        debug!("No config at {}, using defaults", default_path.display());
        let mut config = Self::default();
        config.merge_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Save atomically: write a temp file next to `path`, then rename
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|source| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let content = self.to_toml()?;
        let temp_path = path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `NEXUS_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) -> Result<()> {
        self.merge_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `NEXUS_*` overrides using `lookup` to read variables
    pub fn merge_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            debug!("Overriding log level from environment: {}", level);
            self.logging.level = level.to_lowercase();
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = match format.to_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(invalid_env(ENV_LOG_FORMAT, format!("unknown format '{other}'")));
                }
            };
        }
        if let Some(attempts) = lookup(ENV_MAX_DELIVERY_ATTEMPTS) {
            self.bus.max_delivery_attempts = parse_env(ENV_MAX_DELIVERY_ATTEMPTS, &attempts)?;
        }
        if let Some(policy) = lookup(ENV_BACKPRESSURE) {
            self.bus.backpressure = match policy.to_lowercase().as_str() {
                "reject-new" => BackpressurePolicy::RejectNew,
                "drop-oldest" => BackpressurePolicy::DropOldest,
                "block" => BackpressurePolicy::Block,
                other => {
                    return Err(invalid_env(ENV_BACKPRESSURE, format!("unknown policy '{other}'")));
                }
            };
        }
        if let Some(ttl) = lookup(ENV_DEFAULT_TTL_MS) {
            self.bus.default_ttl_ms = Some(parse_env(ENV_DEFAULT_TTL_MS, &ttl)?);
        }
        if let Some(timeout) = lookup(ENV_HEARTBEAT_TIMEOUT_MS) {
            self.orchestrator.heartbeat_timeout_ms = parse_env(ENV_HEARTBEAT_TIMEOUT_MS, &timeout)?;
        }
        if let Some(restarts) = lookup(ENV_MAX_RESTART_ATTEMPTS) {
            self.orchestrator.max_restart_attempts =
                parse_env(ENV_MAX_RESTART_ATTEMPTS, &restarts)?;
        }
        if let Some(backend) = lookup(ENV_LOG_BACKEND) {
            self.log.backend = backend
                .parse()
                .map_err(|reason: String| invalid_env(ENV_LOG_BACKEND, reason))?;
        }
        if let Some(path) = lookup(ENV_LOG_PATH) {
            self.log.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        let bus = &self.bus;
        if bus.max_delivery_attempts == 0 {
            return Err(invalid("bus.max_delivery_attempts must be greater than 0"));
        }
        if bus.retry_base_delay_ms > bus.retry_max_delay_ms {
            return Err(invalid("bus.retry_base_delay_ms cannot exceed bus.retry_max_delay_ms"));
        }
        if bus.sweep_interval_ms == 0 {
            return Err(invalid("bus.sweep_interval_ms must be greater than 0"));
        }
        if bus.log_buffer == 0 {
            return Err(invalid("bus.log_buffer must be greater than 0"));
        }
        if bus.default_ttl_ms == Some(0) {
            return Err(invalid("bus.default_ttl_ms must be greater than 0"));
        }

        let orch = &self.orchestrator;
        if orch.heartbeat_interval_ms == 0 || orch.liveness_interval_ms == 0 {
            return Err(invalid(
                "orchestrator heartbeat and liveness intervals must be greater than 0",
            ));
        }
        if orch.heartbeat_interval_ms >= orch.throttle_after_ms {
            return Err(invalid(
                "orchestrator.heartbeat_interval_ms must be below throttle_after_ms",
            ));
        }
        if orch.throttle_after_ms >= orch.heartbeat_timeout_ms {
            return Err(invalid(
                "orchestrator.throttle_after_ms must be below heartbeat_timeout_ms",
            ));
        }
        if !(orch.saturation_threshold > 0.0 && orch.saturation_threshold <= 1.0) {
            return Err(invalid("orchestrator.saturation_threshold must be in (0, 1]"));
        }
        if orch.task_timeout_ms == 0 || orch.handler_timeout_ms == 0 {
            return Err(invalid("orchestrator task and handler timeouts must be greater than 0"));
        }
        if orch.max_task_records == 0 {
            return Err(invalid("orchestrator.max_task_records must be greater than 0"));
        }

        if self.log.backend == LogBackend::Sqlite && self.log.path.is_none() {
            return Err(invalid("log.path is required for the sqlite backend"));
        }
        if self.log.retention.max_records == Some(0) {
            return Err(invalid("log.retention.max_records must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.clone()) {
                return Err(ConfigError::Invalid(format!("Duplicate agent id '{}'", agent.id)));
            }
            if agent.mailbox_capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Agent '{}' mailbox_capacity must be greater than 0",
                    agent.id
                )));
            }
            for topic in &agent.topics {
                TopicPattern::parse(topic).map_err(|e| {
                    ConfigError::Invalid(format!("Agent '{}' topic: {}", agent.id, e))
                })?;
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid(reason.to_string())
}

fn invalid_env(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidEnv {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid_env(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = NexusConfig::default();
        assert!(config.validate().is_ok());

        let bus = config.bus.to_bus_config();
        assert_eq!(bus.max_delivery_attempts, 3);
        assert_eq!(bus.retry_base_delay, Duration::from_millis(50));
        assert_eq!(bus.backpressure, BackpressurePolicy::RejectNew);

        let orch = config.orchestrator.to_orchestrator_config();
        assert_eq!(orch.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(orch.max_restart_attempts, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: NexusConfig = toml::from_str(
            r#"
            [bus]
            max_delivery_attempts = 5
            backpressure = "drop-oldest"

            [[agents]]
            id = "solomon"
            behavior = "echo"
            topics = ["agents.solomon"]
            "#,
        )
        .unwrap();

        assert_eq!(config.bus.max_delivery_attempts, 5);
        assert_eq!(config.bus.backpressure, BackpressurePolicy::DropOldest);
        assert_eq!(config.bus.retry_max_delay_ms, 2000);
        assert_eq!(config.orchestrator, OrchestratorSection::default());
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].mailbox_capacity, 256);
    }

    #[test]
    fn test_validation() {
        let mut config = NexusConfig::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.bus.max_delivery_attempts = 0;
        assert!(config.validate().is_err());
        config.bus.max_delivery_attempts = 3;

        config.orchestrator.throttle_after_ms = config.orchestrator.heartbeat_timeout_ms;
        assert!(config.validate().is_err());
        config.orchestrator = OrchestratorSection::default();

        config.agents = vec![AgentSpec::new("a", "echo").with_mailbox_capacity(0)];
        assert!(config.validate().is_err());

        config.agents = vec![AgentSpec::new("a", "echo"), AgentSpec::new("a", "log")];
        assert!(config.validate().is_err());

        config.agents = vec![AgentSpec::new("a", "echo").with_topic("bad..topic")];
        assert!(config.validate().is_err());

        config.agents.clear();
        config.log.backend = LogBackend::Sqlite;
        assert!(config.validate().is_err());
        config.log.path = Some(PathBuf::from("/tmp/nexus.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NexusConfig::default();
        config
            .merge_env_with(env(&[
                (ENV_LOG_LEVEL, "DEBUG"),
                (ENV_LOG_FORMAT, "json"),
                (ENV_MAX_DELIVERY_ATTEMPTS, "7"),
                (ENV_BACKPRESSURE, "block"),
                (ENV_DEFAULT_TTL_MS, "1500"),
                (ENV_MAX_RESTART_ATTEMPTS, "1"),
            ]))
            .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.bus.max_delivery_attempts, 7);
        assert_eq!(config.bus.backpressure, BackpressurePolicy::Block);
        assert_eq!(config.bus.to_bus_config().default_ttl, Some(Duration::from_millis(1500)));
        assert_eq!(config.orchestrator.max_restart_attempts, 1);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = NexusConfig::default();
        let err = config
            .merge_env_with(env(&[(ENV_MAX_DELIVERY_ATTEMPTS, "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { ref key, .. } if key == ENV_MAX_DELIVERY_ATTEMPTS
        ));

        let err = config
            .merge_env_with(env(&[(ENV_LOG_BACKEND, "postgres")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = NexusConfig::sample();
        config.bus.max_delivery_attempts = 4;
        config.save_to_path(&path).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("toml.tmp").exists());

        let loaded = NexusConfig::load(Some(path.as_path())).await.unwrap();
        assert_eq!(loaded.bus.max_delivery_attempts, 4);
        assert_eq!(loaded.agents, config.agents);
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = NexusConfig::default();
        config.bus.max_delivery_attempts = 0;
        assert!(config.save_to_path(&path).await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_explicit_path_fails() {
        let dir = TempDir::new().unwrap();
        let err = NexusConfig::load(Some(dir.path().join("absent.toml").as_path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn test_memory_log_opens() {
        let log = LogSection::default().open().await.unwrap();
        let records = log
            .query(&crate::coordination::LogFilter::default())
            .await
            .unwrap();
        assert!(records.is_empty());
    }
}
