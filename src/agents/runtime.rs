//! Hosts an [`Agent`] on the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::registry::AgentDescriptor;
use super::Agent;
use crate::broker::{MessageBroker, MessageHandler};
use crate::types::{AgentReply, Message, MessageType, SearchCriteria};

/// Running agent. Dropping the handle leaves the agent running; call [`AgentHandle::stop`].
pub struct AgentHandle {
    agent_id: String,
    broker: Arc<MessageBroker>,
    heartbeat: JoinHandle<()>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Keep serving requests without announcing liveness; the registry
    /// demotes the agent as beats go missing.
    pub fn stop_heartbeat(&self) {
        self.heartbeat.abort();
    }

    /// Stop heartbeats and delivery. The registry entry is left to decay.
    pub fn stop(self) {
        self.heartbeat.abort();
        self.broker.unsubscribe(&self.agent_id);
    }
}

pub struct AgentRuntime;

impl AgentRuntime {
    /// Register `agent`, subscribe it to the broker and start heartbeating.
    pub fn start(agent: Arc<dyn Agent>, broker: Arc<MessageBroker>) -> AgentHandle {
        let agent_id = agent.agent_id().to_string();
        let registry = Arc::clone(broker.registry());
        registry.register(
            AgentDescriptor::new(agent_id.clone(), agent.capabilities())
                .with_fallback_priority(agent.fallback_priority()),
        );

        broker.subscribe(
            agent_id.clone(),
            Arc::new(RequestHandler {
                agent,
                broker: Arc::clone(&broker),
            }),
        );

        let heartbeat = Self::spawn_heartbeat(
            agent_id.clone(),
            Arc::clone(&broker),
            registry.config().heartbeat_interval(),
        );

        AgentHandle {
            agent_id,
            broker,
            heartbeat,
        }
    }

    fn spawn_heartbeat(
        agent_id: String,
        broker: Arc<MessageBroker>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(every);
            loop {
                interval_timer.tick().await;
                if let Err(e) = broker.publish(Message::heartbeat(agent_id.clone())) {
                    debug!(agent_id = %agent_id, "Heartbeat not accepted: {}", e);
                }
            }
        })
    }
}

struct RequestHandler {
    agent: Arc<dyn Agent>,
    broker: Arc<MessageBroker>,
}

#[async_trait]
impl MessageHandler for RequestHandler {
    async fn handle(&self, message: Message) {
        if message.message_type != MessageType::Request {
            debug!(
                agent_id = self.agent.agent_id(),
                message_type = ?message.message_type,
                "Ignoring non-request message"
            );
            return;
        }

        // Each request runs on its own task so a slow fetch does not hold up the queue
        let agent = Arc::clone(&self.agent);
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            let reply = answer(agent.as_ref(), &message).await;
            let payload = match serde_json::to_value(&reply) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(agent_id = agent.agent_id(), "Failed to encode reply: {}", e);
                    return;
                }
            };

            if let Err(e) = broker.publish(Message::response_to(&message, agent.agent_id(), payload)) {
                warn!(agent_id = agent.agent_id(), "Failed to publish response: {}", e);
            }
        });
    }
}

async fn answer(agent: &dyn Agent, message: &Message) -> AgentReply {
    let criteria: SearchCriteria = match serde_json::from_value(message.payload.clone()) {
        Ok(criteria) => criteria,
        Err(e) => {
            return AgentReply::Error {
                message: format!("Malformed request payload: {}", e),
            }
        }
    };

    let started = Instant::now();
    match agent.handle_request(&criteria).await {
        Ok(mut result) => {
            result.agent_id = agent.agent_id().to_string();
            if result.search_time_ms == 0 {
                result.search_time_ms = started.elapsed().as_millis() as u64;
            }
            AgentReply::Success { result }
        }
        Err(e) => AgentReply::Error {
            message: e.to_string(),
        },
    }
}
