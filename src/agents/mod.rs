//! Agents and the infrastructure around them
//!
//! An [`Agent`] is an opaque data provider. It is only ever reached through the
//! [`MessageBroker`](crate::broker::MessageBroker): [`AgentRuntime`] subscribes
//! it, answers REQUEST messages with [`AgentReply`](crate::types::AgentReply)
//! payloads, and emits heartbeats on the registry's interval.

pub mod catalog;
pub mod circuit_breaker;
pub mod registry;
pub mod runtime;

use crate::types::{Capability, PartialResult, Result, SearchCriteria};
use async_trait::async_trait;

// Re-export commonly used types
pub use catalog::CatalogAgent;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitState};
pub use registry::{AgentDescriptor, AgentRegistry, AgentRegistryBuilder, HealthSummary};
pub use runtime::{AgentHandle, AgentRuntime};

/// Uniform request/response contract every agent implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable id the agent is registered and addressed under
    fn agent_id(&self) -> &str;

    /// What the agent can answer
    fn capabilities(&self) -> Vec<Capability>;

    /// Lower is preferred when several agents share a capability
    fn fallback_priority(&self) -> u32 {
        0
    }

    /// Fetch items matching `criteria`
    async fn handle_request(&self, criteria: &SearchCriteria) -> Result<PartialResult>;
}
