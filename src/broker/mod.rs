//! Message Broker
//!
//! Typed, prioritized delivery between the orchestrator and agents. Agents
//! never talk to each other directly; everything goes through here.
//!
//! - `publish` enqueues on each recipient's inbound queue and returns at once
//! - `request` publishes a REQUEST and waits for the RESPONSE that carries its
//!   id as `correlation_id`, or times out (no retries)
//! - `subscribe` attaches a handler that receives one message at a time,
//!   highest priority first, FIFO within a priority
//! - HEARTBEAT messages are not queued; they update the registry directly
//!
//! Undeliverable messages end up in a bounded dead-letter log.

mod queue;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::registry::AgentRegistry;
use crate::types::{AppError, Message, MessageType, Result};
use crate::utils::toml_config::BrokerConfig;
use queue::Inbox;

/// Receives messages delivered to one subscriber.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Not registered, or unhealthy
    Unroutable,
    /// Inbound queue at `max_queue_depth`
    QueueFull,
    /// Response arrived after its requester stopped waiting
    LateResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub recipient: String,
    pub reason: RejectReason,
}

/// Outcome of a successful `publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejection>,
}

impl DeliveryReceipt {
    fn new(message_id: Uuid) -> Self {
        Self {
            message_id,
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }

    fn reject(&mut self, recipient: &str, reason: RejectReason) {
        self.rejected.push(Rejection {
            recipient: recipient.to_string(),
            reason,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The message's own timeout elapsed while it was queued
    Expired,
    /// A `request` gave up waiting for the response
    Timeout,
    /// The recipient was deregistered before delivery
    Unroutable,
    LateResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub requests: u64,
    pub responses: u64,
    pub statuses: u64,
    pub heartbeats: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub timeouts: u64,
    pub dead_letters: u64,
    pub pending_requests: usize,
    pub queue_depths: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    statuses: AtomicU64,
    heartbeats: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
    dead_letters: AtomicU64,
}

impl Counters {
    fn published(&self, message_type: MessageType) {
        let counter = match message_type {
            MessageType::Request => &self.requests,
            MessageType::Response => &self.responses,
            MessageType::Status => &self.statuses,
            MessageType::Heartbeat => &self.heartbeats,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type Waiter = oneshot::Sender<Result<Message>>;

pub struct MessageBroker {
    registry: Arc<AgentRegistry>,
    config: BrokerConfig,
    inboxes: Mutex<HashMap<String, Inbox>>,
    pending: Mutex<HashMap<Uuid, Waiter>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    counters: Counters,
}

impl MessageBroker {
    pub fn new(registry: Arc<AgentRegistry>, config: BrokerConfig) -> Self {
        Self {
            registry,
            config,
            inboxes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Hand a message to the broker without waiting for delivery.
    ///
    /// Fails with `InvalidRecipient` when no recipient is registered and
    /// routable, or `QueueFull` when every routable recipient is saturated.
    /// A message marked `degraded` only needs its recipients to be registered.
    pub fn publish(&self, message: Message) -> Result<DeliveryReceipt> {
        self.counters.published(message.message_type);

        match message.message_type {
            MessageType::Heartbeat => {
                self.registry
                    .mark_heartbeat(&message.sender, Instant::now())?;
                Ok(DeliveryReceipt::new(message.id))
            }
            MessageType::Response if message.correlation_id.is_some() => {
                Ok(self.route_response(message))
            }
            _ => self.enqueue(message),
        }
    }

    /// Publish a REQUEST and wait for its correlated RESPONSE.
    ///
    /// On timeout the request is dead-lettered and `AgentTimeout` is returned.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let recipient = message
            .recipients
            .first()
            .cloned()
            .ok_or_else(|| AppError::InvalidRecipient("request has no recipient".to_string()))?;
        let message_id = message.id;
        let copy = message.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id, tx);
        let _guard = PendingGuard {
            broker: self,
            message_id,
        };

        self.publish(message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Internal(format!(
                "Response channel for request {} closed",
                message_id
            ))),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.dead_letter(copy, DeadLetterReason::Timeout);
                Err(AppError::AgentTimeout {
                    agent_id: recipient,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Deliver messages for `agent_id` to `handler`, replacing any earlier subscription.
    pub fn subscribe(self: &Arc<Self>, agent_id: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let agent_id = agent_id.into();
        let notify = {
            let mut inboxes = self.inboxes.lock();
            Arc::clone(&inboxes.entry(agent_id.clone()).or_default().notify)
        };

        let broker = Arc::clone(self);
        let loop_id = agent_id.clone();
        let task = tokio::spawn(async move {
            broker.delivery_loop(&loop_id, notify, handler).await;
        });

        if let Some(previous) = self.subscriptions.lock().insert(agent_id.clone(), task) {
            previous.abort();
        }
        debug!(agent_id = %agent_id, "Subscribed");
    }

    /// Stop delivering to `agent_id`. Queued messages stay queued.
    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        match self.subscriptions.lock().remove(agent_id) {
            Some(task) => {
                task.abort();
                debug!(agent_id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Stop every delivery loop
    pub fn shutdown(&self) {
        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
    }

    /// Most recent dead letters, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let queue_depths = self
            .inboxes
            .lock()
            .iter()
            .map(|(recipient, inbox)| (recipient.clone(), inbox.len()))
            .collect();

        BrokerStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            statuses: self.counters.statuses.load(Ordering::Relaxed),
            heartbeats: self.counters.heartbeats.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            dead_letters: self.counters.dead_letters.load(Ordering::Relaxed),
            pending_requests: self.pending.lock().len(),
            queue_depths,
        }
    }

    fn enqueue(&self, message: Message) -> Result<DeliveryReceipt> {
        if message.recipients.is_empty() {
            return Err(AppError::InvalidRecipient(
                "message has no recipients".to_string(),
            ));
        }

        let message = Arc::new(message);
        let mut receipt = DeliveryReceipt::new(message.id);
        {
            let mut inboxes = self.inboxes.lock();
            for recipient in &message.recipients {
                let reachable = if message.degraded {
                    self.registry.contains(recipient)
                } else {
                    self.registry.is_routable(recipient)
                };
                if !reachable {
                    receipt.reject(recipient, RejectReason::Unroutable);
                    continue;
                }

                let inbox = inboxes.entry(recipient.clone()).or_default();
                if inbox.len() >= self.config.max_queue_depth {
                    receipt.reject(recipient, RejectReason::QueueFull);
                    continue;
                }

                inbox.push(Arc::clone(&message));
                receipt.accepted.push(recipient.clone());
            }
        }

        self.counters
            .rejected
            .fetch_add(receipt.rejected.len() as u64, Ordering::Relaxed);

        if receipt.accepted.is_empty() {
            let recipients = message.recipients.join(", ");
            let saturated = receipt
                .rejected
                .iter()
                .any(|r| r.reason == RejectReason::QueueFull);
            return Err(if saturated {
                AppError::QueueFull(recipients)
            } else {
                AppError::InvalidRecipient(recipients)
            });
        }

        debug!(
            message_id = %message.id,
            message_type = ?message.message_type,
            accepted = ?receipt.accepted,
            "Message enqueued"
        );
        Ok(receipt)
    }

    fn route_response(&self, message: Message) -> DeliveryReceipt {
        let mut receipt = DeliveryReceipt::new(message.id);
        let waiter = message
            .correlation_id
            .and_then(|id| self.pending.lock().remove(&id));

        match waiter {
            Some(tx) => {
                receipt.accepted = message.recipients.clone();
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(Ok(message));
            }
            None => {
                for recipient in &message.recipients {
                    receipt.reject(recipient, RejectReason::LateResponse);
                }
                self.dead_letter(message, DeadLetterReason::LateResponse);
            }
        }
        receipt
    }

    async fn delivery_loop(&self, agent_id: &str, notify: Arc<Notify>, handler: Arc<dyn MessageHandler>) {
        loop {
            let next = self.inboxes.lock().get_mut(agent_id).and_then(Inbox::pop);
            let Some(queued) = next else {
                notify.notified().await;
                continue;
            };

            if !self.registry.contains(agent_id) {
                let error = AppError::InvalidRecipient(format!(
                    "{} was deregistered before delivery",
                    agent_id
                ));
                self.fail_waiter(queued.message.id, error);
                self.dead_letter((*queued.message).clone(), DeadLetterReason::Unroutable);
                continue;
            }

            if queued.is_expired_at(Instant::now()) {
                self.dead_letter((*queued.message).clone(), DeadLetterReason::Expired);
                continue;
            }

            debug!(
                agent_id,
                message_id = %queued.message.id,
                priority = ?queued.message.priority,
                "Delivering message"
            );
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            handler.handle((*queued.message).clone()).await;
        }
    }

    fn fail_waiter(&self, message_id: Uuid, error: AppError) {
        if let Some(tx) = self.pending.lock().remove(&message_id) {
            let _ = tx.send(Err(error));
        }
    }

    fn dead_letter(&self, message: Message, reason: DeadLetterReason) {
        warn!(
            message_id = %message.id,
            sender = %message.sender,
            recipients = ?message.recipients,
            ?reason,
            "Message dead-lettered"
        );
        self.counters.dead_letters.fetch_add(1, Ordering::Relaxed);

        let mut letters = self.dead_letters.lock();
        letters.push_back(DeadLetter {
            message,
            reason,
            at: Utc::now(),
        });
        while letters.len() > self.config.dead_letter_capacity {
            letters.pop_front();
        }
    }
}

/// Drops the waiter when `request` returns or its future is dropped.
struct PendingGuard<'a> {
    broker: &'a MessageBroker,
    message_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.pending.lock().remove(&self.message_id);
    }
}
