//! Task records kept by the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::agents::AgentId;
use crate::coordination::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: MessageId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn pending(task_id: MessageId, agent_id: AgentId) -> Self {
        Self {
            task_id,
            agent_id,
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }
}

/// Bounded table of task records; the oldest finished records are evicted
/// first once the limit is reached
#[derive(Debug)]
pub(crate) struct TaskTable {
    records: HashMap<MessageId, TaskRecord>,
    order: VecDeque<MessageId>,
    max_records: usize,
}

impl TaskTable {
    pub(crate) fn new(max_records: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            max_records: max_records.max(1),
        }
    }

    pub(crate) fn insert(&mut self, record: TaskRecord) {
        while self.records.len() >= self.max_records {
            let finished = self
                .order
                .iter()
                .position(|id| self.records.get(id).is_some_and(|r| r.status.is_finished()));
            let Some(index) = finished else { break };
            if let Some(id) = self.order.remove(index) {
                self.records.remove(&id);
            }
        }

        self.order.push_back(record.task_id.clone());
        self.records.insert(record.task_id.clone(), record);
    }

    pub(crate) fn get(&self, task_id: &MessageId) -> Option<&TaskRecord> {
        self.records.get(task_id)
    }

    /// Move a pending task to a final status. Returns false if the task is
    /// unknown or already finished.
    pub(crate) fn finish(
        &mut self,
        task_id: &MessageId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        match self.records.get_mut(task_id) {
            Some(record) if record.status == TaskStatus::Pending => {
                record.status = status;
                record.finished_at = Some(Utc::now());
                record.result = result;
                record.error = error;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn pending_for(&self, agent_id: &AgentId) -> usize {
        self.records
            .values()
            .filter(|r| &r.agent_id == agent_id && r.status == TaskStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_only_once() {
        let mut table = TaskTable::new(8);
        let id = MessageId::from("t1");
        table.insert(TaskRecord::pending(id.clone(), AgentId::from("worker")));

        assert!(table.finish(&id, TaskStatus::Cancelled, None, None));
        assert!(!table.finish(&id, TaskStatus::Completed, Some(json!(1)), None));
        assert_eq!(table.get(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_eviction_prefers_finished() {
        let mut table = TaskTable::new(2);
        let worker = AgentId::from("worker");
        table.insert(TaskRecord::pending(MessageId::from("a"), worker.clone()));
        table.insert(TaskRecord::pending(MessageId::from("b"), worker.clone()));
        table.finish(&MessageId::from("b"), TaskStatus::Completed, None, None);

        table.insert(TaskRecord::pending(MessageId::from("c"), worker.clone()));
        assert!(table.get(&MessageId::from("a")).is_some());
        assert!(table.get(&MessageId::from("b")).is_none());
        assert_eq!(table.pending_for(&worker), 2);
    }
}
