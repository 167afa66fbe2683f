//! # Agora - multi-agent query coordinator
//!
//! Agora answers a free-text query by fanning it out to a set of data agents,
//! collecting what comes back before a deadline, covering for missing agents
//! from a tiered cache, and ranking the merged result.
//!
//! ## Overview
//!
//! Agora can be used in two ways:
//!
//! 1. **As a command-line tool** - Run the `agora` binary against `agora.toml`
//! 2. **As a library** - Embed the coordinator and plug in your own agents
//!
//! ### Basic Example
//!
//! ```rust,ignore
//! use agora::agents::{AgentRuntime, CatalogAgent};
//! use agora::types::Capability;
//! use agora::{AgoraConfig, AppState, Orchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> agora::Result<()> {
//!     let state = AppState::from_config(AgoraConfig::default());
//!     let _background = state.spawn_background_tasks();
//!
//!     let agent = CatalogAgent::from_file("evo", vec![Capability::ProductSearch], "catalogs/evo.json")?;
//!     let _handle = AgentRuntime::start(Arc::new(agent), state.broker.clone());
//!
//!     let orchestrator = Orchestrator::builder(&state).build();
//!     let response = orchestrator
//!         .submit_query("burton snowboard under $500", None, None)
//!         .await?;
//!     println!("{} results ({})", response.results.len(), response.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`agents`] - Agent trait, registry, circuit breakers and the agent host
//! - [`broker`] - Priority message broker with request/response correlation
//! - [`cache`] - Four-tier TTL cache
//! - [`orchestrator`] - The query state machine
//! - [`types`] - Messages, results and errors
//!
//! ## Configuration
//!
//! Everything is read from one TOML file (`agora.toml` by default) which is
//! validated on load.

#![warn(rustdoc::missing_crate_level_docs)]

/// Agents, the registry that tracks them and per-agent circuit breakers.
pub mod agents;
/// Priority message broker.
pub mod broker;
/// Tiered TTL cache.
pub mod cache;
/// Command-line parsing and terminal output.
pub mod cli;
/// Query orchestration.
pub mod orchestrator;
/// Core types (messages, results, errors).
pub mod types;
/// Configuration and logging.
pub mod utils;

// Re-export commonly used types
pub use agents::{Agent, AgentRegistry, AgentRegistryBuilder, CircuitBreakers};
pub use broker::MessageBroker;
pub use cache::{CacheStore, CacheTier, TieredCache};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, QueryHandle, QueryOptions};
pub use types::{AppError, QueryResponse, Result};
pub use utils::toml_config::AgoraConfig;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Shared coordinator components
#[derive(Clone)]
pub struct AppState {
    /// Validated configuration the components were built from
    pub config: Arc<AgoraConfig>,
    /// Agent registry and health tracking
    pub registry: Arc<AgentRegistry>,
    /// Message broker bound to `registry`
    pub broker: Arc<MessageBroker>,
    /// One breaker per agent, created on first use
    pub breakers: Arc<CircuitBreakers>,
    /// Result cache
    pub cache: Arc<TieredCache>,
}

impl AppState {
    pub fn from_config(config: AgoraConfig) -> Self {
        let registry = Arc::new(AgentRegistry::from_config(&config));
        let broker = Arc::new(MessageBroker::new(
            Arc::clone(&registry),
            config.broker.clone(),
        ));
        let breakers = Arc::new(CircuitBreakers::new(config.circuit_breaker.clone()));
        let cache = Arc::new(TieredCache::new(config.cache.clone()));

        Self {
            config: Arc::new(config),
            registry,
            broker,
            breakers,
            cache,
        }
    }

    /// Start the registry health monitor and, if configured, the cache sweep.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.registry.start_health_monitor()];
        if let Some(secs) = self.config.cache.sweep_interval_secs {
            tasks.push(self.cache.start_sweep_task(Duration::from_secs(secs)));
        }
        tasks
    }

    /// Signal background tasks and delivery loops to stop
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.cache.shutdown();
        self.broker.shutdown();
    }
}
