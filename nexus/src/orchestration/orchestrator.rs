//! Agent Orchestrator
//!
//! Owns the registration records of every agent attached to the bus and
//! drives their lifecycle:
//!
//! - registration with duplicate detection and crash recovery
//! - heartbeat tracking and a periodic liveness check that throttles slow
//!   agents and crashes silent ones
//! - restarts with exponential backoff up to a budget
//! - drain or discard on unregister
//! - task submission as REQUEST messages, with per-task records
//!
//! Every status change is published on `system.lifecycle`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::task_bridge::TaskBridge;
use super::tasks::{TaskRecord, TaskStatus, TaskTable};
use super::{OrchestratorError, Result};
use crate::agents::worker::cancel_payload;
use crate::agents::{
    AgentBehavior, AgentContext, AgentId, AgentLauncher, AgentRegistration, AgentSpec, AgentStatus,
    AgentWorker, HeartbeatSink, TaskReply, ThrottleReason, WorkerConfig,
};
use crate::coordination::{
    BusError, CorrelationId, MailboxReceiver, Message, MessageBus, MessageId, MessageKind, Priority,
    PublishReceipt, SystemEvent, TopicPattern,
};

const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// What happens to queued messages when an agent is unregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnregisterPolicy {
    /// Stop new deliveries and let the agent work through its mailbox,
    /// bounded by the drain grace period
    #[default]
    Drain,
    /// Drop whatever is still queued
    Discard,
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often spawned agents heartbeat
    pub heartbeat_interval: Duration,
    /// Silence after which an ACTIVE agent is throttled
    pub throttle_after: Duration,
    /// Silence after which an agent is declared crashed
    pub heartbeat_timeout: Duration,
    /// Period of the liveness check
    pub liveness_interval: Duration,
    pub max_restart_attempts: u32,
    pub restart_backoff_base: Duration,
    /// Mailbox fill ratio at which an agent counts as saturated
    pub saturation_threshold: f64,
    pub unregister_policy: UnregisterPolicy,
    pub drain_grace: Duration,
    /// Reply deadline for submitted tasks
    pub task_timeout: Duration,
    /// Upper bound on a single handler invocation inside spawned agents
    pub handler_timeout: Duration,
    pub max_task_records: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            throttle_after: Duration::from_millis(1500),
            heartbeat_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_millis(250),
            max_restart_attempts: 3,
            restart_backoff_base: Duration::from_millis(100),
            saturation_threshold: 0.9,
            unregister_policy: UnregisterPolicy::Drain,
            drain_grace: Duration::from_secs(2),
            task_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(30),
            max_task_records: 10_000,
        }
    }
}

impl OrchestratorConfig {
    /// Delay before restart number `restarts + 1`
    pub fn restart_delay(&self, restarts: u32) -> Duration {
        let factor = 2u32.saturating_pow(restarts);
        self.restart_backoff_base
            .saturating_mul(factor)
            .min(MAX_RESTART_DELAY)
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            heartbeat_interval: self.heartbeat_interval,
            handler_timeout: self.handler_timeout,
            ..WorkerConfig::default()
        }
    }
}

/// Result of a successful registration: the record plus the receiving end
/// of the agent's mailbox
pub struct Registration {
    pub record: AgentRegistration,
    pub mailbox: MailboxReceiver,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("record", &self.record)
            .field("mailbox_depth", &self.mailbox.len())
            .finish()
    }
}

/// Receive loop owned by the orchestrator for launcher-backed agents
struct AgentRuntime {
    spec: AgentSpec,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AgentRuntime {
    fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.handle.take()
    }
}

struct AgentEntry {
    record: AgentRegistration,
    /// Start of the current incarnation; silence is measured from here until
    /// the first heartbeat
    incarnation_started: DateTime<Utc>,
    runtime: Option<AgentRuntime>,
}

enum CrashFollowUp {
    Relaunch(AgentSpec, Duration),
    AwaitRegistration,
    GiveUp,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    bus: MessageBus,
    launcher: Arc<dyn AgentLauncher>,
    identity: AgentId,
    agents: Mutex<HashMap<AgentId, AgentEntry>>,
    tasks: Mutex<TaskTable>,
    bridge: TaskBridge,
    shutdown: CancellationToken,
    background: TaskTracker,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Registration, health and task front end for agents on a [`MessageBus`]
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl AgentOrchestrator {
    pub fn new(
        bus: MessageBus,
        launcher: Arc<dyn AgentLauncher>,
        config: OrchestratorConfig,
    ) -> Self {
        let identity = AgentId::from("orchestrator");
        let tasks = TaskTable::new(config.max_task_records);
        Self {
            inner: Arc::new(OrchestratorInner {
                bridge: TaskBridge::new(bus.clone(), identity.clone()),
                config,
                bus,
                launcher,
                identity,
                agents: Mutex::new(HashMap::new()),
                tasks: Mutex::new(tasks),
                shutdown: CancellationToken::new(),
                background: TaskTracker::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Start the periodic liveness check. Calling it again is a no-op.
    pub fn start(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let inner = self.inner.clone();
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.liveness_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.liveness_check();
                    }
                }
            }
            debug!("Liveness monitor stopped");
        }));
        info!("Orchestrator started");
    }

    // ==========================================================================
    // Registration
    // ==========================================================================

    /// Register an externally driven agent. The caller owns the returned
    /// mailbox and is expected to call [`heartbeat`](Self::heartbeat).
    ///
    /// Re-registering a CRASHED agent counts as a restart: its subscriptions
    /// and restart count carry over and pending messages move into the new
    /// mailbox.
    pub fn register<I, S>(
        &self,
        agent_id: impl Into<AgentId>,
        topics: I,
        mailbox_capacity: usize,
    ) -> Result<Registration>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let agent_id = agent_id.into();
        let patterns = parse_topics(topics)?;
        self.inner.register(agent_id, patterns, mailbox_capacity)
    }

    /// Launch an agent from its spec and drive it with an orchestrator-owned
    /// receive loop. Such agents are relaunched automatically after a crash.
    pub fn spawn_agent(&self, spec: AgentSpec) -> Result<AgentRegistration> {
        let behavior = self.inner.launcher.launch(&spec)?;
        let patterns = parse_topics(&spec.topics)?;
        let registration = self
            .inner
            .register(spec.id.clone(), patterns, spec.mailbox_capacity)?;
        self.inner.start_worker(&spec, behavior, registration.mailbox);
        Ok(registration.record)
    }

    /// Unregister with the configured policy
    pub async fn unregister(&self, agent_id: &AgentId) -> Result<usize> {
        self.unregister_with(agent_id, self.inner.config.unregister_policy)
            .await
    }

    /// Move the agent through STOPPING to STOPPED and detach it from the bus.
    /// Returns how many queued messages were discarded.
    pub async fn unregister_with(
        &self,
        agent_id: &AgentId,
        policy: UnregisterPolicy,
    ) -> Result<usize> {
        self.inner.unregister(agent_id, policy).await
    }

    /// Add a subscription for a registered agent
    pub fn subscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<bool> {
        let parsed = TopicPattern::parse(pattern)?;
        let mut agents = self.inner.agents.lock();
        let entry = live_entry(&mut agents, agent_id)?;
        let added = self.inner.bus.subscribe(agent_id, pattern)?;
        entry.record.subscribed_topics.insert(parsed);
        Ok(added)
    }

    pub fn unsubscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<bool> {
        let parsed = TopicPattern::parse(pattern)?;
        let mut agents = self.inner.agents.lock();
        let entry = live_entry(&mut agents, agent_id)?;
        let removed = self.inner.bus.unsubscribe(agent_id, pattern)?;
        entry.record.subscribed_topics.remove(&parsed);
        Ok(removed)
    }

    // ==========================================================================
    // Health
    // ==========================================================================

    /// Record a heartbeat. Promotes STARTING agents and agents throttled for
    /// missed heartbeats to ACTIVE.
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<AgentStatus> {
        self.inner.heartbeat(agent_id)
    }

    /// Run one liveness pass immediately. Returns the number of agents whose
    /// status changed.
    pub fn liveness_check(&self) -> usize {
        self.inner.liveness_check()
    }

    /// Report an unhandled fault in an agent, crashing it
    pub fn report_fault(&self, agent_id: &AgentId, reason: &str) -> Result<()> {
        {
            let agents = self.inner.agents.lock();
            let entry = agents
                .get(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            let from = entry.record.status;
            if !from.can_transition_to(AgentStatus::Crashed) {
                return Err(OrchestratorError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from,
                    to: AgentStatus::Crashed,
                });
            }
        }
        self.inner.crash(agent_id, reason);
        Ok(())
    }

    // ==========================================================================
    // Queries
    // ==========================================================================

    pub fn agent_status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        self.inner
            .agents
            .lock()
            .get(agent_id)
            .map(|entry| entry.record.status)
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<AgentRegistration> {
        self.inner
            .agents
            .lock()
            .get(agent_id)
            .map(|entry| entry.record.clone())
    }

    /// All known agents, ordered by id
    pub fn agents(&self) -> Vec<AgentRegistration> {
        let mut records: Vec<AgentRegistration> = self
            .inner
            .agents
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    // ==========================================================================
    // Tasks
    // ==========================================================================

    /// Send a task to an agent as a NORMAL priority REQUEST. The returned id
    /// is the request's message id.
    pub fn submit_task(&self, agent_id: &AgentId, task: serde_json::Value) -> Result<MessageId> {
        self.submit_task_with_priority(agent_id, task, Priority::Normal)
    }

    pub fn submit_task_with_priority(
        &self,
        agent_id: &AgentId,
        task: serde_json::Value,
        priority: Priority,
    ) -> Result<MessageId> {
        match self.agent_status(agent_id) {
            Some(status) if status != AgentStatus::Stopped => {}
            _ => return Err(OrchestratorError::AgentNotFound(agent_id.to_string())),
        }

        let request = Message::builder(self.inner.identity.clone())
            .kind(MessageKind::Request)
            .recipient(agent_id.clone())
            .priority(priority)
            .payload(task)
            .build();
        let pending = self
            .inner
            .bus
            .publish_expecting_reply(request, self.inner.config.task_timeout)?;
        let task_id = pending.receipt().message_id.clone();

        self.inner
            .tasks
            .lock()
            .insert(TaskRecord::pending(task_id.clone(), agent_id.clone()));

        let inner = self.inner.clone();
        let tracked = task_id.clone();
        self.inner.background.spawn(async move {
            let outcome = pending.wait_cancellable(&inner.shutdown).await;
            inner.complete_task(&tracked, outcome);
        });

        debug!("Submitted task {} to {}", task_id, agent_id);
        Ok(task_id)
    }

    /// Ask the agent to drop a pending task. Returns false when the task had
    /// already finished.
    pub fn cancel_task(&self, task_id: &MessageId) -> Result<bool> {
        let agent_id = {
            let tasks = self.inner.tasks.lock();
            match tasks.get(task_id) {
                None => return Err(OrchestratorError::TaskNotFound(task_id.to_string())),
                Some(record) if record.status.is_finished() => return Ok(false),
                Some(record) => record.agent_id.clone(),
            }
        };

        let control = Message::builder(self.inner.identity.clone())
            .recipient(agent_id.clone())
            .priority(Priority::Critical)
            .payload(cancel_payload(task_id))
            .build();
        self.inner.bus.publish(control)?;
        // Tasks are submitted without an explicit correlation id, so the
        // request id is the correlation id
        self.inner.bus.cancel_request(&CorrelationId::from(task_id));

        let cancelled = self.inner.tasks.lock().finish(
            task_id,
            TaskStatus::Cancelled,
            None,
            Some("cancelled by request".to_string()),
        );
        if cancelled {
            info!("Cancelled task {} on {}", task_id, agent_id);
        }
        Ok(cancelled)
    }

    pub fn task_status(&self, task_id: &MessageId) -> Option<TaskRecord> {
        self.inner.tasks.lock().get(task_id).cloned()
    }

    /// Number of tasks still awaiting a reply from an agent
    pub fn pending_tasks(&self, agent_id: &AgentId) -> usize {
        self.inner.tasks.lock().pending_for(agent_id)
    }

    /// Publish a task for the external queue bridge
    pub fn handoff_task(
        &self,
        task_name: impl Into<String>,
        args: serde_json::Value,
        priority: Priority,
    ) -> Result<PublishReceipt> {
        Ok(self.inner.bridge.handoff(task_name, args, priority)?)
    }

    // ==========================================================================
    // Shutdown
    // ==========================================================================

    /// Stop the liveness monitor, pending restarts and every receive loop.
    /// All agents end up STOPPED. The bus itself is left running.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.shutdown.cancel();

        let monitor = self.inner.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!("Liveness monitor ended abnormally: {}", e);
            }
        }

        let mut workers = Vec::new();
        let mut events = Vec::new();
        {
            let mut agents = self.inner.agents.lock();
            for entry in agents.values_mut() {
                if let Some(handle) = entry.runtime.as_mut().and_then(AgentRuntime::stop) {
                    workers.push(handle);
                }
                if entry.record.status.is_live() && entry.record.status != AgentStatus::Stopping {
                    if let Ok(event) = transition(&mut entry.record, AgentStatus::Stopping) {
                        events.push(event);
                    }
                }
                if let Ok(event) = transition(&mut entry.record, AgentStatus::Stopped) {
                    events.push(event);
                }
            }
        }
        self.inner.emit_all(events);

        for handle in workers {
            if tokio::time::timeout(self.inner.config.drain_grace, handle).await.is_err() {
                warn!("Receive loop did not stop within grace period");
            }
        }

        self.inner.background.close();
        if tokio::time::timeout(self.inner.config.drain_grace, self.inner.background.wait())
            .await
            .is_err()
        {
            warn!("Background tasks still running after {:?}", self.inner.config.drain_grace);
        }
        info!("Orchestrator stopped");
    }
}

impl OrchestratorInner {
    fn register(
        &self,
        agent_id: AgentId,
        patterns: BTreeSet<TopicPattern>,
        capacity: usize,
    ) -> Result<Registration> {
        if capacity == 0 {
            return Err(OrchestratorError::InvalidCapacity {
                agent_id: agent_id.to_string(),
                capacity,
            });
        }

        let now = Utc::now();
        let mut agents = self.agents.lock();

        let prior = match agents.get(&agent_id) {
            Some(entry) if entry.record.is_live() => {
                return Err(OrchestratorError::DuplicateAgent(agent_id.to_string()));
            }
            Some(entry) if entry.record.status == AgentStatus::Crashed => {
                Some(entry.record.clone())
            }
            _ => None,
        };

        let (mailbox, record) = match prior {
            Some(previous) => {
                let mailbox = if self.bus.is_attached(&agent_id) {
                    self.bus.rebind_mailbox(&agent_id, capacity)?
                } else {
                    self.bus.register_agent(&agent_id, capacity)?
                };
                let mut subscribed = previous.subscribed_topics;
                subscribed.extend(patterns);
                let record = AgentRegistration {
                    agent_id: agent_id.clone(),
                    subscribed_topics: subscribed,
                    mailbox_capacity: capacity,
                    status: AgentStatus::Starting,
                    throttle_reason: None,
                    last_heartbeat: None,
                    registered_at: previous.registered_at,
                    restart_count: previous.restart_count + 1,
                };
                (mailbox, record)
            }
            None => {
                let mailbox = self.bus.register_agent(&agent_id, capacity)?;
                let record = AgentRegistration {
                    agent_id: agent_id.clone(),
                    subscribed_topics: patterns,
                    mailbox_capacity: capacity,
                    status: AgentStatus::Starting,
                    throttle_reason: None,
                    last_heartbeat: None,
                    registered_at: now,
                    restart_count: 0,
                };
                (mailbox, record)
            }
        };

        for pattern in &record.subscribed_topics {
            self.bus.subscribe(&agent_id, pattern.as_str())?;
        }

        agents.insert(
            agent_id.clone(),
            AgentEntry {
                record: record.clone(),
                incarnation_started: now,
                runtime: None,
            },
        );
        drop(agents);

        info!(
            "Registered agent {} ({} topics, restart {})",
            agent_id,
            record.subscribed_topics.len(),
            record.restart_count
        );
        self.emit(SystemEvent::AgentRegistered {
            agent_id: agent_id.clone(),
            topics: record
                .subscribed_topics
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            restart_count: record.restart_count,
        });
        if record.restart_count > 0 {
            self.emit(SystemEvent::AgentRestarted {
                agent_id,
                restart_count: record.restart_count,
            });
        }

        Ok(Registration { record, mailbox })
    }

    fn start_worker(
        self: &Arc<Self>,
        spec: &AgentSpec,
        behavior: Arc<dyn AgentBehavior>,
        mailbox: MailboxReceiver,
    ) {
        let cancel = self.shutdown.child_token();
        let heartbeat: Arc<dyn HeartbeatSink> = Arc::new(HeartbeatRelay(Arc::downgrade(self)));
        let worker = AgentWorker::new(
            AgentContext::new(spec.id.clone(), self.bus.clone()),
            behavior,
            mailbox,
            heartbeat,
            self.config.worker_config(),
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());

        let mut agents = self.agents.lock();
        match agents.get_mut(&spec.id) {
            Some(entry) => {
                entry.runtime = Some(AgentRuntime {
                    spec: spec.clone(),
                    cancel,
                    handle: Some(handle),
                });
            }
            None => {
                cancel.cancel();
            }
        }
    }

    fn heartbeat(&self, agent_id: &AgentId) -> Result<AgentStatus> {
        let mut agents = self.agents.lock();
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;

        match entry.record.status {
            AgentStatus::Crashed => {
                return Err(OrchestratorError::AgentCrashed(agent_id.to_string()));
            }
            AgentStatus::Stopped => {
                return Err(OrchestratorError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: AgentStatus::Stopped,
                    to: AgentStatus::Active,
                });
            }
            _ => {}
        }

        entry.record.last_heartbeat = Some(Utc::now());

        let recovers = match entry.record.status {
            AgentStatus::Starting => true,
            AgentStatus::Throttled => {
                entry.record.throttle_reason == Some(ThrottleReason::MissedHeartbeats)
            }
            _ => false,
        };
        let event = if recovers {
            Some(transition(&mut entry.record, AgentStatus::Active)?)
        } else {
            None
        };
        let status = entry.record.status;
        drop(agents);

        if let Some(event) = event {
            debug!("Agent {} is {}", agent_id, status);
            self.emit(event);
        }
        Ok(status)
    }

    fn is_saturated(&self, agent_id: &AgentId) -> bool {
        match (self.bus.mailbox_depth(agent_id), self.bus.mailbox_capacity(agent_id)) {
            (Some(depth), Some(capacity)) if capacity > 0 => {
                depth as f64 >= capacity as f64 * self.config.saturation_threshold
            }
            _ => false,
        }
    }

    fn liveness_check(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut crashed = Vec::new();

        {
            let mut agents = self.agents.lock();
            for (agent_id, entry) in agents.iter_mut() {
                if !entry.record.status.is_monitored() {
                    continue;
                }

                let worker_exited = entry
                    .runtime
                    .as_ref()
                    .and_then(|runtime| runtime.handle.as_ref())
                    .is_some_and(JoinHandle::is_finished);
                if worker_exited {
                    crashed.push((agent_id.clone(), "receive loop exited".to_string()));
                    continue;
                }

                let since = entry.record.last_heartbeat.unwrap_or(entry.incarnation_started);
                let silence = (now - since).to_std().unwrap_or_default();
                if silence > self.config.heartbeat_timeout {
                    crashed.push((
                        agent_id.clone(),
                        format!("no heartbeat for {}ms", silence.as_millis()),
                    ));
                    continue;
                }

                let missed = silence > self.config.throttle_after;
                let saturated = self.is_saturated(agent_id);

                match (entry.record.status, entry.record.throttle_reason) {
                    (AgentStatus::Active, _) if missed => {
                        events.extend(throttle(entry, ThrottleReason::MissedHeartbeats));
                    }
                    (AgentStatus::Active, _) if saturated => {
                        events.extend(throttle(entry, ThrottleReason::MailboxSaturated));
                    }
                    (AgentStatus::Throttled, Some(ThrottleReason::MailboxSaturated)) if missed => {
                        // heartbeat recovery takes over from here
                        entry.record.throttle_reason = Some(ThrottleReason::MissedHeartbeats);
                        events.push(SystemEvent::AgentThrottled {
                            agent_id: agent_id.clone(),
                            reason: ThrottleReason::MissedHeartbeats,
                        });
                    }
                    (AgentStatus::Throttled, Some(ThrottleReason::MailboxSaturated))
                        if !saturated =>
                    {
                        if let Ok(event) = transition(&mut entry.record, AgentStatus::Active) {
                            info!("Agent {} mailbox recovered", agent_id);
                            events.push(event);
                        }
                    }
                    _ => {}
                }
            }
        }

        let changed = events
            .iter()
            .filter(|event| matches!(event, SystemEvent::AgentStatusChanged { .. }))
            .count()
            + crashed.len();

        self.emit_all(events);
        for (agent_id, reason) in crashed {
            self.crash(&agent_id, &reason);
        }
        changed
    }

    fn crash(self: &Arc<Self>, agent_id: &AgentId, reason: &str) {
        let mut events = Vec::new();

        let follow_up = {
            let mut agents = self.agents.lock();
            let Some(entry) = agents.get_mut(agent_id) else {
                return;
            };
            let Ok(event) = transition(&mut entry.record, AgentStatus::Crashed) else {
                return;
            };
            events.push(event);

            if let Some(handle) = entry.runtime.as_mut().and_then(AgentRuntime::stop) {
                handle.abort();
            }

            let restarts = entry.record.restart_count;
            error!("Agent {} crashed: {} (restarts so far: {})", agent_id, reason, restarts);
            events.push(SystemEvent::AgentCrashed {
                agent_id: agent_id.clone(),
                reason: reason.to_string(),
                restart_count: restarts,
            });

            if restarts >= self.config.max_restart_attempts {
                CrashFollowUp::GiveUp
            } else {
                match entry.runtime.as_ref() {
                    Some(runtime) => CrashFollowUp::Relaunch(
                        runtime.spec.clone(),
                        self.config.restart_delay(restarts),
                    ),
                    None => CrashFollowUp::AwaitRegistration,
                }
            }
        };
        self.emit_all(events);

        match follow_up {
            CrashFollowUp::GiveUp => self.give_up(agent_id),
            CrashFollowUp::AwaitRegistration => {
                info!("Agent {} may re-register to restart", agent_id);
            }
            CrashFollowUp::Relaunch(spec, delay) => {
                let inner = self.clone();
                self.background.spawn(async move {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(delay) => inner.relaunch(spec),
                    }
                });
            }
        }
    }

    /// CRASHED -> STOPPED once no restart is possible; detaches the agent
    fn give_up(&self, agent_id: &AgentId) {
        let restarts = {
            let mut agents = self.agents.lock();
            let Some(entry) = agents.get_mut(agent_id) else {
                return;
            };
            if transition(&mut entry.record, AgentStatus::Stopped).is_err() {
                return;
            }
            entry.runtime = None;
            entry.record.restart_count
        };

        warn!("Agent {} stopped: restart budget exhausted after {} restarts", agent_id, restarts);
        self.emit(SystemEvent::AgentStatusChanged {
            agent_id: agent_id.clone(),
            from: AgentStatus::Crashed,
            to: AgentStatus::Stopped,
        });
        self.emit(SystemEvent::RestartBudgetExhausted {
            agent_id: agent_id.clone(),
            restarts,
        });

        match self.bus.unregister_agent(agent_id) {
            Ok(discarded) => self.emit(SystemEvent::AgentUnregistered {
                agent_id: agent_id.clone(),
                discarded,
            }),
            Err(e) => debug!("Agent {} already detached: {}", agent_id, e),
        }
    }

    fn relaunch(self: &Arc<Self>, spec: AgentSpec) {
        let still_crashed = self
            .agents
            .lock()
            .get(&spec.id)
            .is_some_and(|entry| entry.record.status == AgentStatus::Crashed);
        if !still_crashed {
            debug!("Skipping relaunch of {}: no longer crashed", spec.id);
            return;
        }

        let behavior = match self.launcher.launch(&spec) {
            Ok(behavior) => behavior,
            Err(e) => {
                error!("Relaunch of {} failed: {}", spec.id, e);
                self.give_up(&spec.id);
                return;
            }
        };
        let mailbox = match self.bus.rebind_mailbox(&spec.id, spec.mailbox_capacity) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                error!("Relaunch of {} failed: {}", spec.id, e);
                self.give_up(&spec.id);
                return;
            }
        };

        let restart_count = {
            let mut agents = self.agents.lock();
            let Some(entry) = agents.get_mut(&spec.id) else {
                return;
            };
            if transition(&mut entry.record, AgentStatus::Starting).is_err() {
                return;
            }
            entry.record.restart_count += 1;
            entry.record.last_heartbeat = None;
            entry.incarnation_started = Utc::now();
            entry.record.restart_count
        };

        self.start_worker(&spec, behavior, mailbox);
        info!("Restarted agent {} (restart {})", spec.id, restart_count);
        self.emit(SystemEvent::AgentStatusChanged {
            agent_id: spec.id.clone(),
            from: AgentStatus::Crashed,
            to: AgentStatus::Starting,
        });
        self.emit(SystemEvent::AgentRestarted {
            agent_id: spec.id,
            restart_count,
        });
    }

    async fn unregister(&self, agent_id: &AgentId, policy: UnregisterPolicy) -> Result<usize> {
        let (runtime, stopping) = {
            let mut agents = self.agents.lock();
            let entry = agents
                .get_mut(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;

            let stopping = match entry.record.status {
                AgentStatus::Stopping => {
                    return Err(OrchestratorError::InvalidTransition {
                        agent_id: agent_id.to_string(),
                        from: AgentStatus::Stopping,
                        to: AgentStatus::Stopping,
                    });
                }
                AgentStatus::Crashed | AgentStatus::Stopped => None,
                _ => Some(transition(&mut entry.record, AgentStatus::Stopping)?),
            };
            (entry.runtime.take(), stopping)
        };
        let was_live = stopping.is_some();
        if let Some(event) = stopping {
            self.emit(event);
        }

        info!("Unregistering agent {} ({:?})", agent_id, policy);

        if was_live && policy == UnregisterPolicy::Drain {
            self.drain(agent_id, runtime).await;
        } else if let Some(mut runtime) = runtime {
            if let Some(handle) = runtime.stop() {
                handle.abort();
            }
        }

        let discarded = match self.bus.unregister_agent(agent_id) {
            Ok(discarded) => discarded,
            Err(BusError::AgentNotFound(_)) => 0,
            Err(e) => return Err(e.into()),
        };

        let event = {
            let mut agents = self.agents.lock();
            agents
                .remove(agent_id)
                .and_then(|mut entry| transition(&mut entry.record, AgentStatus::Stopped).ok())
        };
        if let Some(event) = event {
            self.emit(event);
        }
        self.emit(SystemEvent::AgentUnregistered {
            agent_id: agent_id.clone(),
            discarded,
        });

        info!("Unregistered agent {} ({} discarded)", agent_id, discarded);
        Ok(discarded)
    }

    /// Close the mailbox and give the agent up to the grace period to work
    /// through it
    async fn drain(&self, agent_id: &AgentId, runtime: Option<AgentRuntime>) {
        if let Err(e) = self.bus.close_mailbox(agent_id) {
            debug!("Nothing to drain for {}: {}", agent_id, e);
            return;
        }

        let grace = self.config.drain_grace;
        match runtime {
            Some(mut runtime) => {
                let Some(mut handle) = runtime.handle.take() else {
                    return;
                };
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!("Agent {} did not drain within {:?}", agent_id, grace);
                    runtime.cancel.cancel();
                    handle.abort();
                }
            }
            None => {
                let deadline = Instant::now() + grace;
                while self.bus.mailbox_depth(agent_id).unwrap_or(0) > 0
                    && Instant::now() < deadline
                {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            }
        }
    }

    fn complete_task(&self, task_id: &MessageId, outcome: crate::coordination::Result<Message>) {
        let (status, result, error) = match outcome {
            Ok(reply) => match TaskReply::from_message(&reply) {
                TaskReply::Ok { result } => (TaskStatus::Completed, Some(result), None),
                TaskReply::Error { message } if message == "cancelled" => {
                    (TaskStatus::Cancelled, None, Some(message))
                }
                TaskReply::Error { message } => (TaskStatus::Failed, None, Some(message)),
            },
            Err(e @ BusError::CorrelationTimeout { .. }) => {
                (TaskStatus::TimedOut, None, Some(e.to_string()))
            }
            Err(e @ BusError::Cancelled) => (TaskStatus::Cancelled, None, Some(e.to_string())),
            Err(e) => (TaskStatus::Failed, None, Some(e.to_string())),
        };

        if self.tasks.lock().finish(task_id, status, result, error) {
            debug!("Task {} finished: {:?}", task_id, status);
        }
    }

    fn emit(&self, event: SystemEvent) {
        if let Err(e) = self.bus.publish_event(event) {
            debug!("Dropped lifecycle event: {}", e);
        }
    }

    fn emit_all(&self, events: Vec<SystemEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

/// Heartbeat path from receive loops back to the orchestrator
struct HeartbeatRelay(Weak<OrchestratorInner>);

impl HeartbeatSink for HeartbeatRelay {
    fn beat(&self, agent_id: &AgentId) {
        if let Some(inner) = self.0.upgrade() {
            if let Err(e) = inner.heartbeat(agent_id) {
                debug!("Heartbeat from {} ignored: {}", agent_id, e);
            }
        }
    }
}

fn parse_topics<I, S>(topics: I) -> Result<BTreeSet<TopicPattern>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    topics
        .into_iter()
        .map(|topic| TopicPattern::parse(topic.as_ref()).map_err(OrchestratorError::from))
        .collect()
}

fn live_entry<'a>(
    agents: &'a mut HashMap<AgentId, AgentEntry>,
    agent_id: &AgentId,
) -> Result<&'a mut AgentEntry> {
    match agents.get_mut(agent_id) {
        Some(entry) if entry.record.status != AgentStatus::Stopped => Ok(entry),
        _ => Err(OrchestratorError::AgentNotFound(agent_id.to_string())),
    }
}

fn transition(record: &mut AgentRegistration, to: AgentStatus) -> Result<SystemEvent> {
    let from = record.status;
    if !from.can_transition_to(to) {
        return Err(OrchestratorError::InvalidTransition {
            agent_id: record.agent_id.to_string(),
            from,
            to,
        });
    }
    record.status = to;
    if to != AgentStatus::Throttled {
        record.throttle_reason = None;
    }
    Ok(SystemEvent::AgentStatusChanged {
        agent_id: record.agent_id.clone(),
        from,
        to,
    })
}

fn throttle(entry: &mut AgentEntry, reason: ThrottleReason) -> Vec<SystemEvent> {
    match transition(&mut entry.record, AgentStatus::Throttled) {
        Ok(changed) => {
            entry.record.throttle_reason = Some(reason);
            warn!("Agent {} throttled: {:?}", entry.record.agent_id, reason);
            vec![
                changed,
                SystemEvent::AgentThrottled {
                    agent_id: entry.record.agent_id.clone(),
                    reason,
                },
            ]
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::BuiltinLauncher;
    use crate::coordination::MessageBusConfig;
    use serde_json::json;

    fn fixture(config: OrchestratorConfig) -> (MessageBus, AgentOrchestrator) {
        let bus = MessageBus::in_memory(MessageBusConfig::default());
        bus.start();
        let orchestrator =
            AgentOrchestrator::new(bus.clone(), Arc::new(BuiltinLauncher::new()), config);
        (bus, orchestrator)
    }

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            throttle_after: Duration::from_millis(40),
            heartbeat_timeout: Duration::from_millis(120),
            restart_backoff_base: Duration::from_millis(10),
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn test_restart_delay_backoff() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.restart_delay(0), Duration::from_millis(100));
        assert_eq!(config.restart_delay(1), Duration::from_millis(200));
        assert_eq!(config.restart_delay(3), Duration::from_millis(800));
        assert_eq!(config.restart_delay(40), MAX_RESTART_DELAY);
    }

    #[tokio::test]
    async fn test_register_rejects_live_duplicate_and_zero_capacity() {
        let (bus, orchestrator) = fixture(OrchestratorConfig::default());
        let id = AgentId::from("solomon");

        let registration = orchestrator.register(id.clone(), ["agents.solomon"], 8).unwrap();
        assert_eq!(registration.record.status, AgentStatus::Starting);
        assert_eq!(registration.record.restart_count, 0);
        assert_eq!(bus.subscriptions_of(&id).len(), 1);

        let err = orchestrator.register(id.clone(), ["agents.solomon"], 8).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateAgent(_)));

        let err = orchestrator.register("other", ["x"], 0).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidCapacity { capacity: 0, .. }));

        let err = orchestrator.register("bad", ["a..b"], 4).unwrap_err();
        assert!(matches!(err, OrchestratorError::Bus(BusError::InvalidTopic { .. })));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_promotes_starting_agent() {
        let (bus, orchestrator) = fixture(OrchestratorConfig::default());
        let id = AgentId::from("worker");
        let _registration = orchestrator.register(id.clone(), Vec::<String>::new(), 4).unwrap();

        assert_eq!(orchestrator.heartbeat(&id).unwrap(), AgentStatus::Active);
        assert!(orchestrator.agent(&id).unwrap().last_heartbeat.is_some());

        let err = orchestrator.heartbeat(&AgentId::from("ghost")).unwrap_err();
        assert!(matches!(err, OrchestratorError::AgentNotFound(_)));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_liveness_throttles_then_crashes_silent_agent() {
        let (bus, orchestrator) = fixture(quick_config());
        let id = AgentId::from("quiet");
        let _registration = orchestrator.register(id.clone(), ["jobs.*"], 4).unwrap();
        orchestrator.heartbeat(&id).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        orchestrator.liveness_check();
        let record = orchestrator.agent(&id).unwrap();
        assert_eq!(record.status, AgentStatus::Throttled);
        assert_eq!(record.throttle_reason, Some(ThrottleReason::MissedHeartbeats));

        // a heartbeat clears a missed-heartbeat throttle
        assert_eq!(orchestrator.heartbeat(&id).unwrap(), AgentStatus::Active);

        tokio::time::sleep(Duration::from_millis(150)).await;
        orchestrator.liveness_check();
        assert_eq!(orchestrator.agent_status(&id), Some(AgentStatus::Crashed));
        assert!(matches!(
            orchestrator.heartbeat(&id),
            Err(OrchestratorError::AgentCrashed(_))
        ));

        // subscriptions survive the crash
        assert_eq!(bus.subscriptions_of(&id).len(), 1);

        let again = orchestrator.register(id.clone(), Vec::<String>::new(), 4).unwrap();
        assert_eq!(again.record.restart_count, 1);
        assert_eq!(again.record.status, AgentStatus::Starting);
        assert!(again.record.subscribed_topics.contains(&TopicPattern::parse("jobs.*").unwrap()));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_agent() {
        let config = OrchestratorConfig {
            max_restart_attempts: 0,
            ..quick_config()
        };
        let (bus, orchestrator) = fixture(config);
        let id = AgentId::from("fragile");
        let _registration = orchestrator.register(id.clone(), ["a.b"], 4).unwrap();

        orchestrator.report_fault(&id, "boom").unwrap();
        assert_eq!(orchestrator.agent_status(&id), Some(AgentStatus::Stopped));
        assert!(!bus.is_attached(&id));

        // a stopped agent may register again from scratch
        let fresh = orchestrator.register(id.clone(), ["a.b"], 4).unwrap();
        assert_eq!(fresh.record.restart_count, 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_discard_counts_pending() {
        let (bus, orchestrator) = fixture(OrchestratorConfig::default());
        let id = AgentId::from("idle");
        let _registration = orchestrator.register(id.clone(), ["idle.work"], 8).unwrap();

        for n in 0..3 {
            bus.publish(Message::direct("caller", "idle", json!(n))).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.mailbox_depth(&id) != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let discarded = orchestrator
            .unregister_with(&id, UnregisterPolicy::Discard)
            .await
            .unwrap();
        assert_eq!(discarded, 3);
        assert!(orchestrator.agent(&id).is_none());
        assert!(bus.subscriptions_of(&id).is_empty());

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawned_agent_answers_task() {
        let (bus, orchestrator) = fixture(OrchestratorConfig::default());
        orchestrator.start();

        let spec = AgentSpec::new("solomon", "echo")
            .with_topic("agents.solomon")
            .with_settings(json!({"replies": {"ping": "pong"}}));
        let id = spec.id.clone();
        orchestrator.spawn_agent(spec).unwrap();

        let task_id = orchestrator.submit_task(&id, json!("ping")).unwrap();
        let record = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match orchestrator.task_status(&task_id) {
                    Some(record) if record.status.is_finished() => break record,
                    _ => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!("pong")));
        assert_eq!(orchestrator.pending_tasks(&id), 0);

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.agent_status(&id), Some(AgentStatus::Stopped));
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_task_withdraws_correlation() {
        let (bus, orchestrator) = fixture(OrchestratorConfig {
            task_timeout: Duration::from_millis(50),
            ..OrchestratorConfig::default()
        });
        let id = AgentId::from("external");
        let _registration = orchestrator.register(id.clone(), Vec::<String>::new(), 4).unwrap();

        let task_id = orchestrator.submit_task(&id, json!("never answered")).unwrap();
        assert_eq!(bus.pending_correlations(), 1);

        assert!(orchestrator.cancel_task(&task_id).unwrap());
        assert_eq!(bus.pending_correlations(), 0);

        // Past the original deadline nothing times out
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(bus.metrics().correlation_timeouts, 0);
        assert_eq!(orchestrator.task_status(&task_id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(orchestrator.pending_tasks(&id), 0);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_outstanding_task_waiters() {
        let (bus, orchestrator) = fixture(OrchestratorConfig {
            task_timeout: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        });
        orchestrator.start();
        let id = AgentId::from("external");
        let _registration = orchestrator.register(id.clone(), Vec::<String>::new(), 4).unwrap();

        let task_id = orchestrator.submit_task(&id, json!("never answered")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), orchestrator.shutdown())
            .await
            .unwrap();

        let record = orchestrator.task_status(&task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(bus.pending_correlations(), 0);

        bus.shutdown().await;
    }
}
