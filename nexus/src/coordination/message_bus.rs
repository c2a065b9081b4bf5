//! Message Bus - priority dispatch, routing, delivery and correlation
//!
//! Publishers hand messages to [`MessageBus::publish`], which validates and
//! queues them by priority tier and returns immediately. A single dispatch
//! task pops the highest non-empty tier, resolves destinations against a
//! router snapshot, records the routing decision in the durable log and
//! enqueues a copy into each destination mailbox under the configured
//! back-pressure policy. Rejected copies are retried per recipient with
//! exponential backoff and dead-lettered once attempts run out.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::correlation::{CorrelationTracker, Waiter};
use super::durable_log::{
    DurableLog, InMemoryLog, LogFilter, LogOutcome, LogRecord, RetentionPolicy,
};
use super::mailbox::{BackpressurePolicy, Mailbox, MailboxReceiver, mailbox};
use super::message::{CorrelationId, Message, MessageId, MessageKind, Priority};
use super::priority_queue::PriorityQueueSet;
use super::system_events::{SystemEvent, is_system_topic};
use super::topic_router::{TopicPattern, TopicRouter, validate_publish_topic};
use super::{BusError, Result};
use crate::agents::AgentId;
use crate::monitoring::{BusMetrics, BusMetricsSnapshot};

/// Message bus configuration
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    /// Delivery attempts per recipient before dead-lettering
    pub max_delivery_attempts: u32,

    /// First retry delay, doubled per attempt
    pub retry_base_delay: Duration,

    /// Upper bound for a single retry delay
    pub retry_max_delay: Duration,

    /// Policy applied when a destination mailbox is full
    pub backpressure: BackpressurePolicy,

    /// How long the `Block` policy waits for space
    pub block_timeout: Duration,

    /// Ttl applied to messages published without one
    pub default_ttl: Option<Duration>,

    /// Correlation sweep period
    pub sweep_interval: Duration,

    /// Dead letters kept for inspection
    pub max_dead_letters: usize,

    /// Log records buffered ahead of the writer
    pub log_buffer: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            backpressure: BackpressurePolicy::RejectNew,
            block_timeout: Duration::from_millis(100),
            default_ttl: None,
            sweep_interval: Duration::from_millis(100),
            max_dead_letters: 1000,
            log_buffer: 4096,
        }
    }
}

impl MessageBusConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `retry_max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

/// Acknowledgement returned by `publish`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    pub priority: Priority,
    pub accepted_at: DateTime<Utc>,
}

/// Message whose delivery to one recipient was given up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub recipient: AgentId,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

enum Route {
    /// Resolve destinations from the recipient or topic
    Resolve,
    /// Retry delivery to a single recipient
    Only(AgentId),
}

struct Envelope {
    message: Message,
    route: Route,
}

enum LogCommand {
    Append(LogRecord),
    Flush(oneshot::Sender<()>),
}

struct BusInner {
    config: MessageBusConfig,
    queues: PriorityQueueSet<Envelope>,
    router: TopicRouter,
    mailboxes: RwLock<HashMap<AgentId, Mailbox>>,
    correlations: CorrelationTracker,
    log: Arc<dyn DurableLog>,
    log_tx: RwLock<Option<mpsc::Sender<LogCommand>>>,
    log_rx: Mutex<Option<mpsc::Receiver<LogCommand>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    metrics: BusMetrics,
    accepting: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
    retries: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    log_writer: Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide message bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: MessageBusConfig, log: Arc<dyn DurableLog>) -> Self {
        info!("Initializing message bus");

        let (log_tx, log_rx) = mpsc::channel(config.log_buffer.max(1));

        Self {
            inner: Arc::new(BusInner {
                config,
                queues: PriorityQueueSet::new(),
                router: TopicRouter::new(),
                mailboxes: RwLock::new(HashMap::new()),
                correlations: CorrelationTracker::new(),
                log,
                log_tx: RwLock::new(Some(log_tx)),
                log_rx: Mutex::new(Some(log_rx)),
                dead_letters: Mutex::new(VecDeque::new()),
                metrics: BusMetrics::new(),
                accepting: AtomicBool::new(true),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                retries: TaskTracker::new(),
                dispatcher: Mutex::new(None),
                sweeper: Mutex::new(None),
                log_writer: Mutex::new(None),
            }),
        }
    }

    /// Bus backed by an in-memory log with default retention
    pub fn in_memory(config: MessageBusConfig) -> Self {
        Self::new(config, Arc::new(InMemoryLog::new(RetentionPolicy::default())))
    }

    /// Spawn the dispatch loop, correlation sweeper and log writer.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(rx) = self.inner.log_rx.lock().take() {
            let log = self.inner.log.clone();
            let inner = self.inner.clone();
            *self.inner.log_writer.lock() = Some(tokio::spawn(run_log_writer(inner, log, rx)));
        }

        let inner = self.inner.clone();
        *self.inner.dispatcher.lock() = Some(tokio::spawn(async move {
            while let Some((_, envelope)) = inner.queues.pop().await {
                inner.dispatch(envelope).await;
            }
            debug!("Dispatch loop drained");
        }));

        let inner = self.inner.clone();
        *self.inner.sweeper.lock() = Some(tokio::spawn(run_sweeper(inner)));

        info!("Message bus started");
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }

    // ==========================================================================
    // Publishing
    // ==========================================================================

    /// Validate and queue a message. Never waits for delivery.
    pub fn publish(&self, message: Message) -> Result<PublishReceipt> {
        self.inner.publish(message)
    }

    /// Publish a system event on its reserved topic
    pub fn publish_event(&self, event: SystemEvent) -> Result<PublishReceipt> {
        self.inner.publish(event.into_message())
    }

    /// Register a correlation entry for `message` and publish it.
    ///
    /// The correlation id is the message's own, or its id when absent; the
    /// kind becomes REQUEST.
    pub fn publish_expecting_reply(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<PendingReply> {
        if self.is_closed() {
            return Err(BusError::BusClosed);
        }

        let correlation_id = message.prepare_request();
        let waiter = self
            .inner
            .correlations
            .register(correlation_id.clone(), Instant::now() + timeout)?;

        match self.inner.publish(message) {
            Ok(receipt) => Ok(PendingReply {
                inner: self.inner.clone(),
                receipt,
                waiter,
            }),
            Err(e) => {
                self.inner.correlations.cancel(&correlation_id);
                Err(e)
            }
        }
    }

    /// Publish a request and wait for the correlated response
    pub async fn publish_and_wait(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.publish_expecting_reply(message, timeout)?.wait().await
    }

    /// Like [`publish_and_wait`](Self::publish_and_wait), giving up early when
    /// `cancel` fires
    pub async fn publish_and_wait_cancellable(
        &self,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        self.publish_expecting_reply(message, timeout)?
            .wait_cancellable(cancel)
            .await
    }

    // ==========================================================================
    // Agents & Subscriptions
    // ==========================================================================

    /// Attach an agent, creating its mailbox
    pub fn register_agent(&self, agent_id: &AgentId, capacity: usize) -> Result<MailboxReceiver> {
        if self.is_closed() {
            return Err(BusError::BusClosed);
        }

        let mut mailboxes = self.inner.mailboxes.write();
        if mailboxes.contains_key(agent_id) {
            return Err(BusError::AgentAlreadyAttached(agent_id.to_string()));
        }

        let (tx, rx) = mailbox(agent_id.clone(), capacity)?;
        mailboxes.insert(agent_id.clone(), tx);

        info!("Attached agent {} (mailbox capacity {})", agent_id, capacity);
        Ok(rx)
    }

    /// Detach an agent: drop its subscriptions, close its mailbox and discard
    /// whatever was still queued. Returns the number of discarded messages.
    pub fn unregister_agent(&self, agent_id: &AgentId) -> Result<usize> {
        let mailbox = self
            .inner
            .mailboxes
            .write()
            .remove(agent_id)
            .ok_or_else(|| BusError::AgentNotFound(agent_id.to_string()))?;

        self.inner.router.remove_agent(agent_id);
        mailbox.close();

        let pending = mailbox.drain_pending();
        let discarded = pending.len();
        for message in &pending {
            self.inner.record(
                LogRecord::from_message(message, LogOutcome::Discarded)
                    .with_recipients([agent_id.clone()])
                    .with_detail("mailbox discarded at unregister"),
            );
        }
        self.inner.metrics.record_discarded(discarded as u64);

        info!("Detached agent {} ({} pending discarded)", agent_id, discarded);
        Ok(discarded)
    }

    /// Replace an agent's mailbox with a fresh one, carrying pending
    /// messages over. Subscriptions are untouched. The old receiver sees a
    /// closed, empty mailbox. Messages that no longer fit go back through the
    /// retry path.
    pub fn rebind_mailbox(&self, agent_id: &AgentId, capacity: usize) -> Result<MailboxReceiver> {
        let (old, new_tx, new_rx) = {
            let mut mailboxes = self.inner.mailboxes.write();
            let old = mailboxes
                .get(agent_id)
                .cloned()
                .ok_or_else(|| BusError::AgentNotFound(agent_id.to_string()))?;
            let (new_tx, new_rx) = mailbox(agent_id.clone(), capacity)?;
            mailboxes.insert(agent_id.clone(), new_tx.clone());
            (old, new_tx, new_rx)
        };

        old.close();
        let pending = old.drain_pending();
        let carried = pending.len();
        for message in pending {
            if let Err(message) = new_tx.try_enqueue(message) {
                let priority = message.priority();
                let envelope = Envelope {
                    message,
                    route: Route::Only(agent_id.clone()),
                };
                if self.inner.queues.push(priority, envelope).is_err() {
                    warn!("Bus closed while rebinding mailbox of {}", agent_id);
                }
            }
        }

        debug!("Rebound mailbox of {} ({} pending carried over)", agent_id, carried);
        Ok(new_rx)
    }

    /// Stop new deliveries to an agent while letting it drain what is
    /// already queued. Rejected copies take the retry path.
    pub fn close_mailbox(&self, agent_id: &AgentId) -> Result<()> {
        let mailbox = self
            .inner
            .mailboxes
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| BusError::AgentNotFound(agent_id.to_string()))?;
        mailbox.close();
        Ok(())
    }

    pub fn is_attached(&self, agent_id: &AgentId) -> bool {
        self.inner.mailboxes.read().contains_key(agent_id)
    }

    pub fn attached_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.inner.mailboxes.read().keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Messages waiting in an agent's mailbox
    pub fn mailbox_depth(&self, agent_id: &AgentId) -> Option<usize> {
        self.inner.mailboxes.read().get(agent_id).map(Mailbox::len)
    }

    pub fn mailbox_capacity(&self, agent_id: &AgentId) -> Option<usize> {
        self.inner.mailboxes.read().get(agent_id).map(Mailbox::capacity)
    }

    /// Subscribe an attached agent to a pattern. Returns false if it was
    /// already subscribed.
    pub fn subscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<bool> {
        if !self.is_attached(agent_id) {
            return Err(BusError::AgentNotFound(agent_id.to_string()));
        }
        let pattern = TopicPattern::parse(pattern)?;
        let added = self.inner.router.subscribe(agent_id, &pattern);
        if added {
            debug!("Agent {} subscribed to {}", agent_id, pattern);
        }
        Ok(added)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, agent_id: &AgentId, pattern: &str) -> Result<bool> {
        let pattern = TopicPattern::parse(pattern)?;
        Ok(self.inner.router.unsubscribe(agent_id, &pattern))
    }

    pub fn subscriptions_of(&self, agent_id: &AgentId) -> Vec<TopicPattern> {
        self.inner.router.subscriptions_of(agent_id).into_iter().collect()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.inner.router
    }

    // ==========================================================================
    // Inspection
    // ==========================================================================

    pub async fn query_log(&self, filter: &LogFilter) -> Result<Vec<LogRecord>> {
        Ok(self.inner.log.query(filter).await?)
    }

    /// Wait until every log record produced so far has been appended
    pub async fn flush_log(&self) {
        let tx = self.inner.log_tx.read().clone();
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = tx {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(LogCommand::Flush(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn pending_correlations(&self) -> usize {
        self.inner.correlations.pending()
    }

    /// Withdraw a pending request: its correlation entry is removed and the
    /// waiter fails with `Cancelled`. Returns false if nothing was pending.
    pub fn cancel_request(&self, correlation_id: &CorrelationId) -> bool {
        let cancelled = self.inner.correlations.fail(correlation_id, BusError::Cancelled);
        if cancelled {
            debug!("Request {} withdrawn by caller", correlation_id);
        }
        cancelled
    }

    /// Messages waiting for dispatch across all tiers
    pub fn queued(&self) -> usize {
        self.inner.queues.len()
    }

    /// Queued messages per tier, CRITICAL first
    pub fn queue_depths(&self) -> [usize; 4] {
        self.inner.queues.depths()
    }

    // ==========================================================================
    // Shutdown
    // ==========================================================================

    /// Stop accepting publishes, drain queued messages, fail pending waiters
    /// with `BusClosed`, flush the log and close every mailbox.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down message bus");

        self.inner.shutdown.cancel();
        self.inner.queues.close();
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Dispatch loop failed: {}", e);
            }
        }

        self.inner.retries.close();
        self.inner.retries.wait().await;
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        let failed = self.inner.correlations.fail_all(|| BusError::BusClosed);
        if failed > 0 {
            debug!("Failed {} pending correlations at shutdown", failed);
        }

        for mailbox in self.inner.mailboxes.read().values() {
            mailbox.close();
        }

        self.inner.log_tx.write().take();
        let writer = self.inner.log_writer.lock().take();
        if let Some(handle) = writer {
            if let Err(e) = handle.await {
                error!("Log writer failed: {}", e);
            }
        }

        info!("Message bus stopped");
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("queued", &self.queued())
            .field("attached", &self.inner.mailboxes.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outstanding request published with [`MessageBus::publish_expecting_reply`]
pub struct PendingReply {
    inner: Arc<BusInner>,
    receipt: PublishReceipt,
    waiter: Waiter,
}

impl PendingReply {
    pub fn receipt(&self) -> &PublishReceipt {
        &self.receipt
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.waiter.correlation_id()
    }

    /// Wait for the response or the deadline, whichever comes first
    pub async fn wait(mut self) -> Result<Message> {
        if let Some(outcome) = self.waiter.wait_until_deadline().await {
            return outcome;
        }

        let correlation_id = self.waiter.correlation_id().clone();
        if self.inner.correlations.cancel(&correlation_id) {
            self.inner.note_correlation_timeout(&correlation_id);
            return Err(BusError::CorrelationTimeout {
                correlation_id: correlation_id.to_string(),
            });
        }

        // Resolved or failed concurrently; the outcome is already sent.
        self.waiter.wait().await
    }

    /// Wait as in [`wait`](Self::wait), removing the entry if `cancel` fires
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> Result<Message> {
        let correlation_id = self.waiter.correlation_id().clone();
        let inner = self.inner.clone();

        let wait = self.wait();
        tokio::pin!(wait);

        tokio::select! {
            outcome = &mut wait => outcome,
            _ = cancel.cancelled() => {
                if inner.correlations.cancel(&correlation_id) {
                    debug!("Wait for {} cancelled", correlation_id);
                    Err(BusError::Cancelled)
                } else {
                    wait.await
                }
            }
        }
    }
}

impl BusInner {
    fn publish(&self, mut message: Message) -> Result<PublishReceipt> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BusError::BusClosed);
        }
        validate(&message)?;

        let now = Utc::now();
        message.stamp(now, self.config.default_ttl);

        let receipt = PublishReceipt {
            message_id: message.id().clone(),
            priority: message.priority(),
            accepted_at: now,
        };

        let envelope = Envelope {
            message,
            route: Route::Resolve,
        };
        self.queues
            .push(receipt.priority, envelope)
            .map_err(|_| BusError::BusClosed)?;

        self.metrics.record_published();
        debug!("Accepted message {} ({})", receipt.message_id, receipt.priority);
        Ok(receipt)
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        self.metrics.record_dispatched();
        let Envelope { message, route } = envelope;

        if message.is_expired(Utc::now()) {
            self.metrics.record_expired();
            debug!("Message {} expired before delivery", message.id());
            self.record(LogRecord::from_message(&message, LogOutcome::Expired));
            return;
        }

        if let Route::Only(recipient) = route {
            self.deliver(message, recipient).await;
            return;
        }

        if message.answers_correlation() {
            if let Some(correlation_id) = message.correlation_id().cloned() {
                let record = LogRecord::from_message(&message, LogOutcome::Resolved);
                if self.correlations.resolve(&correlation_id, message.clone()) {
                    self.metrics.record_resolved();
                    debug!("Resolved correlation {}", correlation_id);
                    self.record(record);
                    return;
                }
            }
        }

        let destinations: Vec<AgentId> = {
            let mailboxes = self.mailboxes.read();
            match message.recipient() {
                Some(recipient) => mailboxes
                    .contains_key(recipient)
                    .then(|| recipient.clone())
                    .into_iter()
                    .collect(),
                None => self
                    .router
                    .snapshot()
                    .match_topic(message.topic().unwrap_or_default())
                    .into_iter()
                    .filter(|agent| mailboxes.contains_key(agent))
                    .collect(),
            }
        };

        if destinations.is_empty() {
            self.unroutable(message);
            return;
        }

        self.record(
            LogRecord::from_message(&message, LogOutcome::Routed)
                .with_recipients(destinations.iter().cloned()),
        );

        let last = destinations.len() - 1;
        let mut message = Some(message);
        for (i, recipient) in destinations.into_iter().enumerate() {
            let copy = if i == last {
                message.take()
            } else {
                message.clone()
            };
            if let Some(copy) = copy {
                self.deliver(copy, recipient).await;
            }
        }
    }

    fn unroutable(&self, message: Message) {
        if message.answers_correlation() {
            self.metrics.record_late_response();
            warn!(
                "Discarding late response {} for correlation {:?}",
                message.id(),
                message.correlation_id().map(CorrelationId::as_str)
            );
            self.record(LogRecord::from_message(&message, LogOutcome::LateResponse));
            return;
        }

        self.metrics.record_unroutable();
        debug!("No destination for message {}", message.id());
        self.record(LogRecord::from_message(&message, LogOutcome::Unroutable));

        if message.kind() == MessageKind::Request {
            if let (Some(recipient), Some(correlation_id)) =
                (message.recipient(), message.correlation_id())
            {
                self.correlations
                    .fail(correlation_id, BusError::AgentNotFound(recipient.to_string()));
            }
        }
    }

    async fn deliver(self: &Arc<Self>, message: Message, recipient: AgentId) {
        let mailbox = self.mailboxes.read().get(&recipient).cloned();
        let Some(mailbox) = mailbox else {
            let attempts = message.delivery_attempts();
            self.dead_letter(message, recipient, attempts, "recipient detached".to_string());
            return;
        };

        let outcome = match self.config.backpressure {
            BackpressurePolicy::RejectNew => mailbox.try_enqueue(message),
            BackpressurePolicy::DropOldest => match mailbox.enqueue_displacing(message) {
                Ok(Some(evicted)) => {
                    self.metrics.record_dropped();
                    warn!("Mailbox of {} full, dropped oldest message {}", recipient, evicted.id());
                    self.record(
                        LogRecord::from_message(&evicted, LogOutcome::Dropped)
                            .with_recipients([recipient.clone()])
                            .with_detail("evicted by drop-oldest"),
                    );
                    Ok(())
                }
                Ok(None) => Ok(()),
                Err(message) => Err(message),
            },
            BackpressurePolicy::Block => {
                mailbox
                    .try_enqueue_timeout(message, self.config.block_timeout)
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_delivered();
                debug!("Delivered to {}", recipient);
            }
            Err(message) => self.schedule_retry(message, recipient),
        }
    }

    fn schedule_retry(self: &Arc<Self>, mut message: Message, recipient: AgentId) {
        let attempt = message.record_attempt();
        if attempt >= self.config.max_delivery_attempts {
            self.dead_letter(
                message,
                recipient,
                attempt,
                format!("mailbox full after {attempt} attempts"),
            );
            return;
        }

        let delay = self.config.backoff_delay(attempt);
        self.metrics.record_retried();
        warn!(
            "Mailbox of {} rejected {} (attempt {}), retrying in {:?}",
            recipient,
            message.id(),
            attempt,
            delay
        );

        let inner = self.clone();
        self.retries.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.shutdown.cancelled() => {
                    let attempts = message.delivery_attempts();
                    let reason = "bus shut down before retry".to_string();
                    inner.dead_letter(message, recipient, attempts, reason);
                    return;
                }
            }

            let priority = message.priority();
            let envelope = Envelope {
                message,
                route: Route::Only(recipient),
            };
            if let Err(envelope) = inner.queues.push(priority, envelope) {
                if let Route::Only(recipient) = envelope.route {
                    let attempts = envelope.message.delivery_attempts();
                    let reason = "bus closed".to_string();
                    inner.dead_letter(envelope.message, recipient, attempts, reason);
                }
            }
        });
    }

    fn dead_letter(&self, message: Message, recipient: AgentId, attempts: u32, reason: String) {
        self.metrics.record_dead_lettered();
        warn!("Dead-lettering message {} for {}: {}", message.id(), recipient, reason);

        self.record(
            LogRecord::from_message(&message, LogOutcome::DeadLettered)
                .with_recipients([recipient.clone()])
                .with_detail(reason.clone()),
        );

        {
            let mut dead_letters = self.dead_letters.lock();
            dead_letters.push_back(DeadLetter {
                message: message.clone(),
                recipient: recipient.clone(),
                attempts,
                reason,
                failed_at: Utc::now(),
            });
            while dead_letters.len() > self.config.max_dead_letters {
                dead_letters.pop_front();
            }
        }

        if message.topic().is_some_and(is_system_topic) {
            return;
        }

        let event = SystemEvent::DeliveryExhausted {
            message_id: message.id().clone(),
            correlation_id: message.correlation_id().cloned(),
            sender: message.sender().clone(),
            recipient: recipient.clone(),
            topic: message.topic().map(str::to_string),
            attempts,
        };

        if message.correlation_id().is_some() || message.confirm_delivery() {
            let sender_mailbox = self.mailboxes.read().get(message.sender()).cloned();
            if let Some(sender_mailbox) = sender_mailbox {
                if !sender_mailbox.enqueue(event.direct_to(message.sender().clone())) {
                    debug!("Could not notify {} of delivery failure", message.sender());
                }
            }

            if message.kind() == MessageKind::Request {
                if let Some(correlation_id) = message.correlation_id() {
                    self.correlations.fail(
                        correlation_id,
                        BusError::DeliveryExhausted {
                            message_id: message.id().to_string(),
                            recipient: recipient.to_string(),
                            attempts,
                        },
                    );
                }
            }
        }

        if let Err(e) = self.publish(event.into_message()) {
            debug!("Delivery failure event not published: {}", e);
        }
    }

    fn note_correlation_timeout(&self, correlation_id: &CorrelationId) {
        self.metrics.record_correlation_timeout();
        warn!("Correlation {} timed out", correlation_id);

        self.record(LogRecord {
            message_id: MessageId::from(correlation_id.as_str()),
            correlation_id: Some(correlation_id.clone()),
            topic: None,
            recipient: None,
            sender: AgentId::system(),
            priority: Priority::Normal,
            recorded_at: Utc::now(),
            outcome: LogOutcome::CorrelationTimedOut,
            recipients: Vec::new(),
            detail: None,
        });

        let event = SystemEvent::CorrelationTimeout {
            correlation_id: correlation_id.clone(),
        };
        if let Err(e) = self.publish(event.into_message()) {
            debug!("Correlation timeout event not published: {}", e);
        }
    }

    /// Queue a log record for the writer. Never waits.
    fn record(&self, record: LogRecord) {
        let sent = match self.log_tx.read().as_ref() {
            Some(tx) => tx.try_send(LogCommand::Append(record)).is_ok(),
            None => false,
        };
        if !sent {
            self.metrics.record_log_write_failure();
        }
    }
}

fn validate(message: &Message) -> Result<()> {
    if message.sender().as_str().is_empty() {
        return Err(BusError::InvalidMessage("sender must not be empty".to_string()));
    }

    match (message.topic(), message.recipient()) {
        (None, None) => Err(BusError::InvalidMessage(
            "message needs a topic or a recipient".to_string(),
        )),
        (_, Some(recipient)) if recipient.as_str().is_empty() => {
            Err(BusError::InvalidMessage("recipient must not be empty".to_string()))
        }
        (Some(topic), _) => validate_publish_topic(topic)
            .map_err(|e| BusError::InvalidMessage(e.to_string())),
        (None, Some(_)) => Ok(()),
    }
}

async fn run_sweeper(inner: Arc<BusInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for correlation_id in inner.correlations.sweep(Instant::now()) {
                    inner.note_correlation_timeout(&correlation_id);
                }
            }
        }
    }
}

async fn run_log_writer(
    inner: Arc<BusInner>,
    log: Arc<dyn DurableLog>,
    mut rx: mpsc::Receiver<LogCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Append(record) => {
                if let Err(e) = log.append(record).await {
                    inner.metrics.record_log_write_failure();
                    error!("Failed to append log record: {}", e);
                }
            }
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Log writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> MessageBusConfig {
        MessageBusConfig {
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(10),
            ..MessageBusConfig::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = MessageBusConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(500),
            ..MessageBusConfig::default()
        };

        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_publish_validation() {
        let bus = MessageBus::in_memory(test_config());

        let no_route = Message::builder("caller").payload(json!(1)).build();
        assert!(matches!(bus.publish(no_route), Err(BusError::InvalidMessage(_))));

        let wildcard = Message::to_topic("caller", "agents.*", json!(1));
        assert!(matches!(bus.publish(wildcard), Err(BusError::InvalidMessage(_))));

        let empty_segment = Message::to_topic("caller", "agents..x", json!(1));
        assert!(matches!(bus.publish(empty_segment), Err(BusError::InvalidMessage(_))));

        let ok = Message::to_topic("caller", "agents.solomon", json!(1));
        let receipt = bus.publish(ok).unwrap();
        assert_eq!(receipt.priority, Priority::Normal);
        assert_eq!(bus.queued(), 1);
    }

    #[test]
    fn test_publish_stamps_created_at_and_default_ttl() {
        let bus = MessageBus::in_memory(MessageBusConfig {
            default_ttl: Some(Duration::from_secs(30)),
            ..test_config()
        });
        bus.publish(Message::direct("caller", "worker", json!(null))).unwrap();

        let (_, envelope) = bus.inner.queues.try_pop().unwrap();
        assert!(envelope.message.created_at().is_some());
        assert_eq!(envelope.message.ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_register_agent_rules() {
        let bus = MessageBus::in_memory(test_config());
        let agent = AgentId::from("solomon");

        assert!(matches!(
            bus.register_agent(&agent, 0),
            Err(BusError::InvalidCapacity { capacity: 0, .. })
        ));
        let _rx = bus.register_agent(&agent, 8).unwrap();
        assert!(matches!(
            bus.register_agent(&agent, 8),
            Err(BusError::AgentAlreadyAttached(_))
        ));
        assert!(matches!(
            bus.subscribe(&AgentId::from("ghost"), "x"),
            Err(BusError::AgentNotFound(_))
        ));
        assert!(bus.subscribe(&agent, "agents.solomon").unwrap());
        assert!(!bus.subscribe(&agent, "agents.solomon").unwrap());
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_rejected() {
        let bus = MessageBus::in_memory(test_config());
        bus.start();
        bus.shutdown().await;

        let err = bus
            .publish(Message::to_topic("caller", "x", json!(null)))
            .unwrap_err();
        assert!(matches!(err, BusError::BusClosed));
    }

    #[tokio::test]
    async fn test_direct_delivery_and_log() {
        let bus = MessageBus::in_memory(test_config());
        bus.start();
        let agent = AgentId::from("worker");
        let mut rx = bus.register_agent(&agent, 4).unwrap();

        let receipt = bus
            .publish(Message::direct("caller", "worker", json!("hello")))
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload(), &json!("hello"));

        bus.flush_log().await;
        let records = bus
            .query_log(&LogFilter::for_message(&receipt.message_id))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, LogOutcome::Routed);
        assert_eq!(records[0].recipients, vec![agent]);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_to_unknown_recipient_fails_fast() {
        let bus = MessageBus::in_memory(test_config());
        bus.start();

        let err = bus
            .publish_and_wait(Message::direct("caller", "ghost", json!(1)), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::AgentNotFound(_)));
        assert_eq!(bus.metrics().unroutable, 1);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_rebind_keeps_pending_messages() {
        let bus = MessageBus::in_memory(test_config());
        bus.start();
        let agent = AgentId::from("worker");
        let mut old_rx = bus.register_agent(&agent, 4).unwrap();
        bus.subscribe(&agent, "jobs").unwrap();

        bus.publish(Message::to_topic("caller", "jobs", json!(1))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.mailbox_depth(&agent) != Some(1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut new_rx = bus.rebind_mailbox(&agent, 4).unwrap();
        assert!(old_rx.dequeue().await.is_none());
        assert_eq!(new_rx.try_dequeue().unwrap().payload(), &json!(1));
        assert_eq!(bus.subscriptions_of(&agent).len(), 1);

        bus.shutdown().await;
    }
}
