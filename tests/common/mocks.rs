//! Mock implementations for testing.
//!
//! Scripted agents, interpreters and rankers shared by the integration tests,
//! plus a small harness that wires them onto a broker.

use agora::agents::{Agent, AgentHandle, AgentRuntime};
use agora::orchestrator::{QueryInterpreter, Ranker, RankingContext};
use agora::types::{
    AppError, Availability, Capability, Item, PartialResult, Result, ResultItem, SearchCriteria,
};
use agora::utils::toml_config::AgoraConfig;
use agora::AppState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a [`ScriptedAgent`] does with the next request.
#[derive(Debug, Clone)]
pub enum Script {
    /// Answer with `items` after `latency`
    Succeed { latency: Duration, items: Vec<Item> },
    /// Return an error after `latency`
    Fail { latency: Duration, message: String },
    /// Never answer
    Hang,
}

/// Agent whose behavior is scripted and can be changed mid-test.
///
/// # Examples
///
/// ```ignore
/// let agent = ScriptedAgent::succeeding("evo", vec![item("evo", "custom", "Burton Custom", 599.0)]);
/// agent.set_script(Script::Hang);
/// assert_eq!(agent.calls(), 0);
/// ```
#[derive(Clone)]
pub struct ScriptedAgent {
    agent_id: String,
    capabilities: Vec<Capability>,
    fallback_priority: u32,
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(agent_id: &str, script: Script) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            capabilities: vec![Capability::ProductSearch],
            fallback_priority: 0,
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(agent_id: &str, items: Vec<Item>) -> Self {
        Self::new(
            agent_id,
            Script::Succeed {
                latency: Duration::from_millis(10),
                items,
            },
        )
    }

    pub fn failing(agent_id: &str) -> Self {
        Self::new(
            agent_id,
            Script::Fail {
                latency: Duration::from_millis(10),
                message: format!("{} upstream returned 503", agent_id),
            },
        )
    }

    pub fn hanging(agent_id: &str) -> Self {
        Self::new(agent_id, Script::Hang)
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.fallback_priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Number of requests that reached the agent
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn fallback_priority(&self) -> u32 {
        self.fallback_priority
    }

    async fn handle_request(&self, _criteria: &SearchCriteria) -> Result<PartialResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();

        match script {
            Script::Succeed { latency, items } => {
                tokio::time::sleep(latency).await;
                Ok(PartialResult {
                    agent_id: self.agent_id.clone(),
                    items,
                    search_time_ms: 0,
                })
            }
            Script::Fail { latency, message } => {
                tokio::time::sleep(latency).await;
                Err(AppError::Agent(message))
            }
            Script::Hang => std::future::pending().await,
        }
    }
}

/// A priced, in-stock item.
pub fn item(vendor: &str, id: &str, name: &str, price: f64) -> Item {
    let mut attributes = serde_json::Map::new();
    attributes.insert("category".to_string(), json!("snowboard"));
    Item {
        item_id: id.to_string(),
        name: name.to_string(),
        vendor: vendor.to_string(),
        price: Some(price),
        url: Some(format!("https://{}.example/{}", vendor, id)),
        rating: Some(4.0),
        availability: Availability::InStock,
        attributes,
    }
}

/// Interpreter that counts calls and can be made to fail or stall.
pub struct MockInterpreter {
    calls: AtomicUsize,
    hang: bool,
    fail: bool,
}

impl MockInterpreter {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            hang: false,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryInterpreter for MockInterpreter {
    async fn interpret(&self, raw_query: &str) -> Result<SearchCriteria> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(AppError::Internal("language model unavailable".to_string()));
        }
        Ok(SearchCriteria::new(raw_query.trim().to_lowercase()))
    }
}

/// How a [`MockRanker`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RankerFault {
    Error,
    Hang,
    /// Appends an item nobody returned
    Invent,
    /// Reverses the input
    Reverse,
}

pub struct MockRanker {
    fault: RankerFault,
}

impl MockRanker {
    pub fn new(fault: RankerFault) -> Self {
        Self { fault }
    }
}

#[async_trait]
impl Ranker for MockRanker {
    async fn rank(
        &self,
        mut items: Vec<ResultItem>,
        _context: &RankingContext<'_>,
    ) -> Result<Vec<ResultItem>> {
        match self.fault {
            RankerFault::Error => Err(AppError::Ranking("model offline".to_string())),
            RankerFault::Hang => std::future::pending().await,
            RankerFault::Invent => {
                let mut invented = items[0].clone();
                invented.item_id = "invented".to_string();
                items.push(invented);
                Ok(items)
            }
            RankerFault::Reverse => {
                items.reverse();
                Ok(items)
            }
        }
    }
}

/// Coordinator state plus the agents hosted on it.
pub struct Harness {
    pub state: AppState,
    handles: Vec<AgentHandle>,
}

impl Harness {
    pub fn new(config: AgoraConfig) -> Self {
        Self {
            state: AppState::from_config(config),
            handles: Vec::new(),
        }
    }

    /// Host `agent` on the broker
    pub fn host(&mut self, agent: &ScriptedAgent) {
        let handle = AgentRuntime::start(Arc::new(agent.clone()), Arc::clone(&self.state.broker));
        self.handles.push(handle);
    }

    /// Host `agent` without its heartbeat task, so it decays to UNHEALTHY
    /// while still answering.
    pub fn host_silent(&mut self, agent: &ScriptedAgent) {
        let handle = AgentRuntime::start(Arc::new(agent.clone()), Arc::clone(&self.state.broker));
        handle.stop_heartbeat();
        self.handles.push(handle);
    }

    /// Requests the broker has accepted for publishing so far
    pub fn requests_published(&self) -> u64 {
        self.state.broker.stats().requests
    }

    /// Advance paused time and refresh every agent's heartbeat.
    pub async fn advance(&self, by: Duration) {
        tokio::time::advance(by).await;
        let now = tokio::time::Instant::now();
        for descriptor in self.state.registry.snapshot() {
            self.state
                .registry
                .mark_heartbeat(&descriptor.agent_id, now)
                .unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.stop();
        }
        self.state.shutdown();
    }
}

/// Config with short timeouts suited to paused-time tests.
pub fn test_config() -> AgoraConfig {
    let mut config = AgoraConfig::default();
    config.orchestrator.default_deadline_ms = 3_000;
    config.orchestrator.agent_timeout_ms = 2_000;
    config.orchestrator.deadline_margin_ms = 50;
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.cooldown_ms = 5_000;
    config
}
