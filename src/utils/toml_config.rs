//! TOML-based configuration for Agora
//!
//! This module provides declarative configuration for the orchestrator, broker,
//! registry, circuit breakers, cache tiers and the statically known agents via a
//! TOML file (`agora.toml`).
//!
//! The config is read once at startup; components keep the snapshot they were
//! built from.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Capability;

/// Root configuration structure loaded from agora.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgoraConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Statically known agents keyed by agent id
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

// ============= Logging Configuration =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ============= Orchestrator Configuration =============

/// Controls dispatch breadth and fallback depth. The pipeline is the same in both modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Only the best few agents per capability; fall back to LIVE cache only
    #[default]
    Optimized,
    /// Every capable agent; fall back through LIVE then STATIC cache
    MaximumReliability,
}

impl std::str::FromStr for OrchestrationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "optimized" | "fast" => Ok(Self::Optimized),
            "maximum_reliability" | "reliable" => Ok(Self::MaximumReliability),
            other => Err(format!(
                "Unknown mode '{}'. Use 'optimized' or 'maximum-reliability'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Overall budget for one query, from RECEIVED to RESPONDED
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Upper bound for a single agent request
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,

    /// Per-agent timeouts end at least this long before the overall deadline
    #[serde(default = "default_deadline_margin_ms")]
    pub deadline_margin_ms: u64,

    #[serde(default = "default_interpreter_timeout_ms")]
    pub interpreter_timeout_ms: u64,

    #[serde(default = "default_ranker_timeout_ms")]
    pub ranker_timeout_ms: u64,

    #[serde(default)]
    pub mode: OrchestrationMode,

    /// Agents per capability dispatched in `optimized` mode
    #[serde(default = "default_optimized_breadth")]
    pub optimized_breadth: usize,

    /// Extra attempts per agent after a failure, while time and the breaker allow
    #[serde(default)]
    pub agent_retries: u32,

    /// Endpoint name the orchestrator uses as message sender
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_deadline_ms() -> u64 {
    10_000
}

fn default_agent_timeout_ms() -> u64 {
    2_000
}

fn default_deadline_margin_ms() -> u64 {
    50
}

fn default_interpreter_timeout_ms() -> u64 {
    2_000
}

fn default_ranker_timeout_ms() -> u64 {
    1_000
}

fn default_optimized_breadth() -> usize {
    3
}

fn default_endpoint() -> String {
    "orchestrator".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            agent_timeout_ms: default_agent_timeout_ms(),
            deadline_margin_ms: default_deadline_margin_ms(),
            interpreter_timeout_ms: default_interpreter_timeout_ms(),
            ranker_timeout_ms: default_ranker_timeout_ms(),
            mode: OrchestrationMode::default(),
            optimized_breadth: default_optimized_breadth(),
            agent_retries: 0,
            endpoint: default_endpoint(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn deadline_margin(&self) -> Duration {
        Duration::from_millis(self.deadline_margin_ms)
    }

    pub fn interpreter_timeout(&self) -> Duration {
        Duration::from_millis(self.interpreter_timeout_ms)
    }

    pub fn ranker_timeout(&self) -> Duration {
        Duration::from_millis(self.ranker_timeout_ms)
    }
}

// ============= Broker Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Messages waiting per recipient before publishes are rejected
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Bounded history of undeliverable messages
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_max_queue_depth() -> usize {
    1024
}

fn default_dead_letter_capacity() -> usize {
    1000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: default_max_queue_depth(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

// ============= Registry Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval agents are expected to heartbeat on
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed intervals that demote health by one level
    #[serde(default = "default_missed_per_demotion")]
    pub missed_heartbeats_per_demotion: u32,

    /// Missed intervals after which an agent is removed (None = never)
    #[serde(default)]
    pub evict_after_missed: Option<u32>,

    /// How often the health monitor task re-evaluates heartbeats
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_missed_per_demotion() -> u32 {
    3
}

fn default_health_check_interval_ms() -> u64 {
    1_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeats_per_demotion: default_missed_per_demotion(),
            evict_after_missed: None,
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

// ============= Circuit Breaker Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Initial cool-down before a trial call is allowed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cap for the doubling cool-down
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

// ============= Cache Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Product specifications (default: 30 days)
    #[serde(default = "default_static_ttl")]
    pub static_ttl_secs: u64,

    /// Prices and availability (default: 15 minutes)
    #[serde(default = "default_live_ttl")]
    pub live_ttl_secs: u64,

    /// Per-user preferences (default: 7 days)
    #[serde(default = "default_user_ttl")]
    pub user_ttl_secs: u64,

    /// Whole responses (default: 1 hour)
    #[serde(default = "default_query_ttl")]
    pub query_ttl_secs: u64,

    /// Entries across all tiers before least-recently-used eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Background sweep of expired entries (None = lazy expiry only)
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_static_ttl() -> u64 {
    30 * 24 * 60 * 60
}

fn default_live_ttl() -> u64 {
    15 * 60
}

fn default_user_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_query_ttl() -> u64 {
    60 * 60
}

fn default_max_entries() -> usize {
    100_000
}

fn default_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_ttl_secs: default_static_ttl(),
            live_ttl_secs: default_live_ttl(),
            user_ttl_secs: default_user_ttl(),
            query_ttl_secs: default_query_ttl(),
            max_entries: default_max_entries(),
            sweep_interval_secs: None,
            enabled: default_enabled(),
        }
    }
}

// ============= Agent Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub capabilities: Vec<Capability>,

    /// Lower is preferred
    #[serde(default)]
    pub fallback_priority: u32,

    /// JSON item catalog served by the built-in catalog agent
    #[serde(default)]
    pub catalog: Option<PathBuf>,

    /// Set to false to keep the descriptor but not register it
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ============= Configuration Loading & Validation =============

/// Configuration warnings that don't prevent operation but may indicate issues
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub kind: ConfigWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarningKind {
    MissingCatalog,
    SingleProvider,
    NoAgents,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AgoraConfig {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: AgoraConfig = toml::from_str(&content)?;

        // Catalog paths are relative to the file that names them
        if let Some(base) = path.parent() {
            for agent in config.agents.values_mut() {
                if let Some(catalog) = agent.catalog.as_mut() {
                    if catalog.is_relative() {
                        *catalog = base.join(&*catalog);
                    }
                }
            }
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orchestrator = &self.orchestrator;

        if orchestrator.default_deadline_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.default_deadline_ms must be greater than zero".to_string(),
            ));
        }

        // A per-agent timeout must leave room for aggregation and ranking
        if orchestrator.agent_timeout_ms + orchestrator.deadline_margin_ms
            >= orchestrator.default_deadline_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "orchestrator.agent_timeout_ms ({}) plus deadline_margin_ms ({}) must be below default_deadline_ms ({})",
                orchestrator.agent_timeout_ms,
                orchestrator.deadline_margin_ms,
                orchestrator.default_deadline_ms
            )));
        }

        if orchestrator.deadline_margin_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.deadline_margin_ms must be greater than zero".to_string(),
            ));
        }

        if orchestrator.optimized_breadth == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.optimized_breadth must be at least 1".to_string(),
            ));
        }

        if orchestrator.endpoint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "orchestrator.endpoint must not be empty".to_string(),
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.circuit_breaker.max_cooldown_ms < self.circuit_breaker.cooldown_ms {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.max_cooldown_ms must not be below cooldown_ms".to_string(),
            ));
        }

        if self.registry.heartbeat_interval_ms == 0
            || self.registry.missed_heartbeats_per_demotion == 0
        {
            return Err(ConfigError::ValidationError(
                "registry.heartbeat_interval_ms and missed_heartbeats_per_demotion must be non-zero"
                    .to_string(),
            ));
        }

        if self.broker.max_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "broker.max_queue_depth must be at least 1".to_string(),
            ));
        }

        let cache = &self.cache;
        if cache.live_ttl_secs > cache.static_ttl_secs {
            return Err(ConfigError::ValidationError(format!(
                "cache.live_ttl_secs ({}) must not exceed static_ttl_secs ({})",
                cache.live_ttl_secs, cache.static_ttl_secs
            )));
        }

        for (agent_id, agent) in &self.agents {
            if agent.capabilities.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Agent '{}' declares no capabilities",
                    agent_id
                )));
            }
            if agent_id == &orchestrator.endpoint {
                return Err(ConfigError::ValidationError(format!(
                    "Agent id '{}' collides with the orchestrator endpoint",
                    agent_id
                )));
            }
        }

        Ok(())
    }

    /// Validate configuration and collect non-fatal warnings
    pub fn validate_with_warnings(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        self.validate()?;

        let mut warnings = Vec::new();
        warnings.extend(self.check_missing_catalogs());
        warnings.extend(self.check_single_provider_capabilities());

        if self.enabled_agents().is_empty() {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::NoAgents,
                message: "No agents are enabled; every query will report no data available"
                    .to_string(),
            });
        }

        Ok(warnings)
    }

    /// Catalog paths that do not exist on disk
    fn check_missing_catalogs(&self) -> Vec<ConfigWarning> {
        self.agents
            .iter()
            .filter_map(|(agent_id, agent)| {
                let path = agent.catalog.as_ref()?;
                if path.exists() {
                    None
                } else {
                    Some(ConfigWarning {
                        kind: ConfigWarningKind::MissingCatalog,
                        message: format!(
                            "Agent '{}' references catalog {:?} which does not exist",
                            agent_id, path
                        ),
                    })
                }
            })
            .collect()
    }

    /// Capabilities with exactly one provider have no live fallback
    fn check_single_provider_capabilities(&self) -> Vec<ConfigWarning> {
        let mut providers: HashMap<Capability, Vec<&str>> = HashMap::new();
        for (agent_id, agent) in self.agents.iter().filter(|(_, a)| a.enabled) {
            for capability in &agent.capabilities {
                providers.entry(*capability).or_default().push(agent_id);
            }
        }

        let mut warnings: Vec<ConfigWarning> = providers
            .into_iter()
            .filter(|(_, agents)| agents.len() == 1)
            .map(|(capability, agents)| ConfigWarning {
                kind: ConfigWarningKind::SingleProvider,
                message: format!(
                    "Capability '{}' is only served by agent '{}'",
                    capability, agents[0]
                ),
            })
            .collect();
        warnings.sort_by(|a, b| a.message.cmp(&b.message));
        warnings
    }

    /// Get agent config by id
    pub fn get_agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }

    /// Ids of all enabled agents
    pub fn enabled_agents(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
