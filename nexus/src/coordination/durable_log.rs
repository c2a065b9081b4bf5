//! Durable message log
//!
//! The bus appends one [`LogRecord`] per routing decision and terminal
//! outcome. Backends implement [`DurableLog`]; the in-memory ring is the
//! default and a SQLite backend is available behind the `sqlite` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::message::{CorrelationId, Message, MessageId, Priority};
use crate::agents::AgentId;

/// Errors raised by log backends
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log backend error: {0}")]
    Backend(String),

    #[error("Log record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for LogError {
    fn from(err: sqlx::Error) -> Self {
        LogError::Backend(format!("sqlite: {err}"))
    }
}

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Terminal or routing outcome recorded for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOutcome {
    /// Destinations resolved, copies handed to mailboxes
    Routed,
    /// Response matched a waiting request
    Resolved,
    /// No subscriber or recipient could take the message
    Unroutable,
    /// Response arrived after its waiter was gone
    LateResponse,
    /// Ttl elapsed before delivery
    Expired,
    /// Retries exhausted for a recipient
    DeadLettered,
    /// Evicted by the drop-oldest policy
    Dropped,
    /// Pending in a mailbox discarded at unregister
    Discarded,
    /// Waiter deadline passed without a response
    CorrelationTimedOut,
}

impl LogOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            LogOutcome::Routed => "ROUTED",
            LogOutcome::Resolved => "RESOLVED",
            LogOutcome::Unroutable => "UNROUTABLE",
            LogOutcome::LateResponse => "LATE_RESPONSE",
            LogOutcome::Expired => "EXPIRED",
            LogOutcome::DeadLettered => "DEAD_LETTERED",
            LogOutcome::Dropped => "DROPPED",
            LogOutcome::Discarded => "DISCARDED",
            LogOutcome::CorrelationTimedOut => "CORRELATION_TIMED_OUT",
        }
    }
}

impl fmt::Display for LogOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogOutcome {
    type Err = LogError;

    fn from_str(s: &str) -> LogResult<Self> {
        let outcome = match s {
            "ROUTED" => LogOutcome::Routed,
            "RESOLVED" => LogOutcome::Resolved,
            "UNROUTABLE" => LogOutcome::Unroutable,
            "LATE_RESPONSE" => LogOutcome::LateResponse,
            "EXPIRED" => LogOutcome::Expired,
            "DEAD_LETTERED" => LogOutcome::DeadLettered,
            "DROPPED" => LogOutcome::Dropped,
            "DISCARDED" => LogOutcome::Discarded,
            "CORRELATION_TIMED_OUT" => LogOutcome::CorrelationTimedOut,
            other => return Err(LogError::Backend(format!("unknown outcome '{other}'"))),
        };
        Ok(outcome)
    }
}

/// One entry of the message history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message_id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub topic: Option<String>,
    pub recipient: Option<AgentId>,
    pub sender: AgentId,
    pub priority: Priority,
    pub recorded_at: DateTime<Utc>,
    pub outcome: LogOutcome,
    #[serde(default)]
    pub recipients: Vec<AgentId>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl LogRecord {
    pub fn from_message(message: &Message, outcome: LogOutcome) -> Self {
        Self {
            message_id: message.id().clone(),
            correlation_id: message.correlation_id().cloned(),
            topic: message.topic().map(str::to_string),
            recipient: message.recipient().cloned(),
            sender: message.sender().clone(),
            priority: message.priority(),
            recorded_at: Utc::now(),
            outcome,
            recipients: Vec::new(),
            detail: None,
        }
    }

    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = AgentId>) -> Self {
        self.recipients = recipients.into_iter().collect();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Query criteria; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
    pub sender: Option<AgentId>,
    pub topic: Option<String>,
    pub outcome: Option<LogOutcome>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn for_message(id: &MessageId) -> Self {
        Self {
            message_id: Some(id.clone()),
            ..Self::default()
        }
    }

    pub fn with_outcome(mut self, outcome: LogOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.message_id.as_ref().is_none_or(|id| &record.message_id == id)
            && self
                .correlation_id
                .as_ref()
                .is_none_or(|id| record.correlation_id.as_ref() == Some(id))
            && self.sender.as_ref().is_none_or(|s| &record.sender == s)
            && self
                .topic
                .as_deref()
                .is_none_or(|t| record.topic.as_deref() == Some(t))
            && self.outcome.is_none_or(|o| record.outcome == o)
            && self.since.is_none_or(|since| record.recorded_at >= since)
    }
}

/// Append-only message history backend
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn append(&self, record: LogRecord) -> LogResult<()>;

    /// Matching records, oldest first
    async fn query(&self, filter: &LogFilter) -> LogResult<Vec<LogRecord>>;
}

/// Count- and age-based retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_records: Option<usize>,
    #[serde(default, with = "opt_secs")]
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_records: Some(100_000),
            max_age: None,
        }
    }
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_records: None,
            max_age: None,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age)
    }
}

/// In-memory ring buffer log
#[derive(Debug, Default)]
pub struct InMemoryLog {
    records: Mutex<VecDeque<LogRecord>>,
    retention: RetentionPolicy,
}

impl InMemoryLog {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append(&self, record: LogRecord) -> LogResult<()> {
        let mut records = self.records.lock();
        records.push_back(record);

        if let Some(max) = self.retention.max_records {
            while records.len() > max {
                records.pop_front();
            }
        }
        if let Some(cutoff) = self.retention.cutoff(Utc::now()) {
            while records.front().is_some_and(|r| r.recorded_at < cutoff) {
                records.pop_front();
            }
        }

        Ok(())
    }

    async fn query(&self, filter: &LogFilter) -> LogResult<Vec<LogRecord>> {
        let records = self.records.lock();
        let mut matched: Vec<LogRecord> =
            records.iter().filter(|r| filter.matches(r)).cloned().collect();

        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }

        Ok(matched)
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLog;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use sqlx::{
        Row,
        sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    };
    use std::path::Path;

    /// SQLite-backed message history
    #[derive(Debug, Clone)]
    pub struct SqliteLog {
        pool: SqlitePool,
        retention: RetentionPolicy,
    }

    impl SqliteLog {
        /// Open (or create) the log database at `path`
        pub async fn open(path: &Path, retention: RetentionPolicy) -> LogResult<Self> {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;

            sqlx::query(
                r"
                CREATE TABLE IF NOT EXISTS message_log (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id TEXT NOT NULL,
                    correlation_id TEXT,
                    topic TEXT,
                    recipient TEXT,
                    sender TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    recipients TEXT NOT NULL,
                    detail TEXT
                )
                ",
            )
            .execute(&pool)
            .await?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_message_log_message_id ON message_log (message_id)",
            )
            .execute(&pool)
            .await?;

            Ok(Self { pool, retention })
        }

        async fn apply_retention(&self) -> LogResult<()> {
            if let Some(max) = self.retention.max_records {
                sqlx::query(
                    r"
                    DELETE FROM message_log
                    WHERE seq <= (SELECT COALESCE(MAX(seq), 0) FROM message_log) - ?1
                    ",
                )
                .bind(max as i64)
                .execute(&self.pool)
                .await?;
            }
            if let Some(cutoff) = self.retention.cutoff(Utc::now()) {
                sqlx::query("DELETE FROM message_log WHERE recorded_at < ?1")
                    .bind(cutoff.to_rfc3339())
                    .execute(&self.pool)
                    .await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DurableLog for SqliteLog {
        async fn append(&self, record: LogRecord) -> LogResult<()> {
            let recipients = serde_json::to_string(&record.recipients)?;

            sqlx::query(
                r"
                INSERT INTO message_log
                    (message_id, correlation_id, topic, recipient, sender, priority,
                     recorded_at, outcome, recipients, detail)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
            )
            .bind(record.message_id.as_str())
            .bind(record.correlation_id.as_ref().map(|c| c.as_str().to_string()))
            .bind(&record.topic)
            .bind(record.recipient.as_ref().map(|r| r.as_str().to_string()))
            .bind(record.sender.as_str())
            .bind(record.priority.as_str())
            .bind(record.recorded_at.to_rfc3339())
            .bind(record.outcome.as_str())
            .bind(recipients)
            .bind(&record.detail)
            .execute(&self.pool)
            .await?;

            self.apply_retention().await
        }

        async fn query(&self, filter: &LogFilter) -> LogResult<Vec<LogRecord>> {
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

            let rows = sqlx::query(
                r"
                SELECT message_id, correlation_id, topic, recipient, sender, priority,
                       recorded_at, outcome, recipients, detail
                FROM message_log
                WHERE (?1 IS NULL OR message_id = ?1)
                  AND (?2 IS NULL OR correlation_id = ?2)
                  AND (?3 IS NULL OR sender = ?3)
                  AND (?4 IS NULL OR topic = ?4)
                  AND (?5 IS NULL OR outcome = ?5)
                  AND (?6 IS NULL OR recorded_at >= ?6)
                ORDER BY seq DESC
                LIMIT ?7
                ",
            )
            .bind(filter.message_id.as_ref().map(|m| m.as_str().to_string()))
            .bind(filter.correlation_id.as_ref().map(|c| c.as_str().to_string()))
            .bind(filter.sender.as_ref().map(|s| s.as_str().to_string()))
            .bind(&filter.topic)
            .bind(filter.outcome.map(|o| o.as_str()))
            .bind(filter.since.map(|s| s.to_rfc3339()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            let mut records = Vec::with_capacity(rows.len());
            for row in rows.into_iter().rev() {
                let priority: String = row.get("priority");
                let recorded_at: String = row.get("recorded_at");
                let outcome: String = row.get("outcome");
                let recipients: String = row.get("recipients");

                records.push(LogRecord {
                    message_id: MessageId::from(row.get::<String, _>("message_id").as_str()),
                    correlation_id: row
                        .get::<Option<String>, _>("correlation_id")
                        .map(CorrelationId::from),
                    topic: row.get("topic"),
                    recipient: row.get::<Option<String>, _>("recipient").map(AgentId::from),
                    sender: AgentId::from(row.get::<String, _>("sender")),
                    priority: priority.parse().map_err(LogError::Backend)?,
                    recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                        .map_err(|e| LogError::Backend(format!("invalid recorded_at: {e}")))?
                        .with_timezone(&Utc),
                    outcome: outcome.parse()?,
                    recipients: serde_json::from_str(&recipients)?,
                    detail: row.get("detail"),
                });
            }

            Ok(records)
        }
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
