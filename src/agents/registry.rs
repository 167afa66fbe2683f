//! Agent Registry
//!
//! Tracks every known agent, what it can do, and how healthy it currently looks.
//!
//! ## Health decay
//!
//! Agents are expected to heartbeat every `heartbeat_interval`. Each run of
//! `missed_heartbeats_per_demotion` missed intervals demotes health one level
//! (`healthy -> degraded -> unhealthy`). A single heartbeat restores `healthy`.
//! Health is derived from the last heartbeat at read time, so lookups are
//! accurate even when the monitor task is not running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{AgentId, AppError, Capability, HealthStatus, Result};
use crate::utils::toml_config::{AgoraConfig, RegistryConfig};

/// Public view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub capabilities: Vec<Capability>,
    /// Ignored on registration; filled in on reads
    #[serde(default = "default_health")]
    pub health_status: HealthStatus,
    /// Lower is preferred
    #[serde(default)]
    pub fallback_priority: u32,
    /// Time since the last heartbeat when this view was taken
    #[serde(default)]
    pub since_heartbeat_ms: u64,
}

fn default_health() -> HealthStatus {
    HealthStatus::Healthy
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<AgentId>, capabilities: Vec<Capability>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            health_status: HealthStatus::Healthy,
            fallback_priority: 0,
            since_heartbeat_ms: 0,
        }
    }

    pub fn with_fallback_priority(mut self, priority: u32) -> Self {
        self.fallback_priority = priority;
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
struct AgentRecord {
    capabilities: Vec<Capability>,
    fallback_priority: u32,
    last_heartbeat_at: Instant,
    /// Last health written by `check_heartbeats`, for transition logging
    recorded_health: HealthStatus,
}

/// Counts of agents per health level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl HealthSummary {
    /// Roll the counts up into one status for the whole pool.
    pub fn overall(&self) -> HealthStatus {
        if self.total > 0 && self.healthy == self.total {
            HealthStatus::Healthy
        } else if self.healthy + self.degraded > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// What one pass of [`AgentRegistry::check_heartbeats`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatReport {
    pub transitions: Vec<(AgentId, HealthStatus)>,
    pub evicted: Vec<AgentId>,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    config: RegistryConfig,
    shutdown: AtomicBool,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registry pre-populated with every enabled `[agents.*]` entry
    pub fn from_config(config: &AgoraConfig) -> Self {
        let registry = Self::new(config.registry.clone());
        for (agent_id, agent) in config.agents.iter().filter(|(_, a)| a.enabled) {
            registry.register(
                AgentDescriptor::new(agent_id.clone(), agent.capabilities.clone())
                    .with_fallback_priority(agent.fallback_priority),
            );
        }
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register or update an agent.
    ///
    /// Re-registering replaces capabilities and fallback priority but keeps the
    /// heartbeat history, so a flapping agent cannot reset its health this way.
    pub fn register(&self, descriptor: AgentDescriptor) {
        let mut agents = self.agents.write();
        match agents.get_mut(&descriptor.agent_id) {
            Some(record) => {
                record.capabilities = descriptor.capabilities;
                record.fallback_priority = descriptor.fallback_priority;
                debug!(agent_id = %descriptor.agent_id, "Agent re-registered");
            }
            None => {
                info!(
                    agent_id = %descriptor.agent_id,
                    capabilities = ?descriptor.capabilities,
                    "Agent registered"
                );
                agents.insert(
                    descriptor.agent_id,
                    AgentRecord {
                        capabilities: descriptor.capabilities,
                        fallback_priority: descriptor.fallback_priority,
                        last_heartbeat_at: Instant::now(),
                        recorded_health: HealthStatus::Healthy,
                    },
                );
            }
        }
    }

    /// Remove an agent. Returns false if it was not registered.
    pub fn deregister(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().remove(agent_id).is_some();
        if removed {
            info!(agent_id, "Agent deregistered");
        }
        removed
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Record a heartbeat observed at `timestamp`.
    pub fn mark_heartbeat(&self, agent_id: &str, timestamp: Instant) -> Result<()> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| AppError::NotFound(format!("Agent '{}' is not registered", agent_id)))?;

        // Out-of-order heartbeats never move the clock backwards
        if timestamp > record.last_heartbeat_at {
            record.last_heartbeat_at = timestamp;
        }
        if record.recorded_health != HealthStatus::Healthy {
            info!(agent_id, from = %record.recorded_health, "Agent recovered");
            record.recorded_health = HealthStatus::Healthy;
        }
        Ok(())
    }

    /// Current health of one agent
    pub fn health(&self, agent_id: &str) -> Option<HealthStatus> {
        let now = Instant::now();
        self.agents
            .read()
            .get(agent_id)
            .map(|record| self.health_at(record, now))
    }

    /// Whether the broker may deliver to `agent_id`
    pub fn is_routable(&self, agent_id: &str) -> bool {
        self.health(agent_id)
            .map(HealthStatus::is_routable)
            .unwrap_or(false)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        let now = Instant::now();
        self.agents
            .read()
            .get(agent_id)
            .map(|record| self.describe(agent_id, record, now))
    }

    /// Agents offering `capability`, best first.
    ///
    /// Ordered by `fallback_priority`, then healthy before degraded. Unhealthy
    /// agents only appear when nothing healthier offers the capability.
    pub fn list_by_capability(&self, capability: Capability) -> Vec<AgentDescriptor> {
        let now = Instant::now();
        let agents = self.agents.read();

        let (mut routable, mut unhealthy): (Vec<_>, Vec<_>) = agents
            .iter()
            .map(|(agent_id, record)| self.describe(agent_id, record, now))
            .filter(|descriptor| descriptor.has_capability(capability))
            .partition(|descriptor| descriptor.health_status.is_routable());

        routable.sort_by(|a, b| {
            a.fallback_priority
                .cmp(&b.fallback_priority)
                .then(a.health_status.cmp(&b.health_status))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        if routable.is_empty() {
            unhealthy.sort_by(|a, b| {
                a.fallback_priority
                    .cmp(&b.fallback_priority)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            });
            routable.extend(unhealthy);
        }
        routable
    }

    /// Apply the decay rule to every agent and evict long-silent ones.
    pub fn check_heartbeats(&self, now: Instant) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut agents = self.agents.write();

        for (agent_id, record) in agents.iter_mut() {
            let health = self.health_at(record, now);
            if health != record.recorded_health {
                warn!(
                    agent_id = %agent_id,
                    from = %record.recorded_health,
                    to = %health,
                    "Agent health changed after missed heartbeats"
                );
                record.recorded_health = health;
                report.transitions.push((agent_id.clone(), health));
            }
        }

        if let Some(limit) = self.config.evict_after_missed {
            let interval = self.config.heartbeat_interval();
            agents.retain(|agent_id, record| {
                let missed = missed_intervals(now, record.last_heartbeat_at, interval);
                if missed >= u64::from(limit) {
                    warn!(agent_id = %agent_id, missed, "Evicting silent agent");
                    report.evicted.push(agent_id.clone());
                    false
                } else {
                    true
                }
            });
        }

        report.transitions.sort();
        report.evicted.sort();
        report
    }

    /// Run [`AgentRegistry::check_heartbeats`] periodically until shutdown.
    pub fn start_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let every = registry.config.health_check_interval();

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(every);
            loop {
                interval_timer.tick().await;

                if registry.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let report = registry.check_heartbeats(Instant::now());
                if !report.evicted.is_empty() {
                    debug!("Health monitor evicted {} agents", report.evicted.len());
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Every agent, sorted by id
    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        let now = Instant::now();
        let mut descriptors: Vec<_> = self
            .agents
            .read()
            .iter()
            .map(|(agent_id, record)| self.describe(agent_id, record, now))
            .collect();
        descriptors.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        descriptors
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for descriptor in self.snapshot() {
            summary.total += 1;
            match descriptor.health_status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }
        summary
    }

    fn health_at(&self, record: &AgentRecord, now: Instant) -> HealthStatus {
        let missed = missed_intervals(
            now,
            record.last_heartbeat_at,
            self.config.heartbeat_interval(),
        );
        let demotions = missed / u64::from(self.config.missed_heartbeats_per_demotion.max(1));

        let mut health = HealthStatus::Healthy;
        for _ in 0..demotions.min(2) {
            health = health.demote();
        }
        health
    }

    fn describe(&self, agent_id: &str, record: &AgentRecord, now: Instant) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: agent_id.to_string(),
            capabilities: record.capabilities.clone(),
            health_status: self.health_at(record, now),
            fallback_priority: record.fallback_priority,
            since_heartbeat_ms: now
                .saturating_duration_since(record.last_heartbeat_at)
                .as_millis() as u64,
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn missed_intervals(now: Instant, last: Instant, interval: Duration) -> u64 {
    let silent = now.saturating_duration_since(last);
    if interval.is_zero() {
        return 0;
    }
    (silent.as_millis() / interval.as_millis()) as u64
}

/// Builder for creating an AgentRegistry with a fluent API
pub struct AgentRegistryBuilder {
    config: RegistryConfig,
    descriptors: Vec<AgentDescriptor>,
}

impl AgentRegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: RegistryConfig::default(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_agent(mut self, descriptor: AgentDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn build(self) -> AgentRegistry {
        let registry = AgentRegistry::new(self.config);
        for descriptor in self.descriptors {
            registry.register(descriptor);
        }
        registry
    }
}

impl Default for AgentRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval_ms: 1_000,
            missed_heartbeats_per_demotion: 3,
            evict_after_missed: None,
            health_check_interval_ms: 500,
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistryBuilder::new()
            .with_config(config())
            .with_agent(
                AgentDescriptor::new("evo", vec![Capability::ProductSearch, Capability::PriceQuote])
                    .with_fallback_priority(1),
            )
            .with_agent(
                AgentDescriptor::new("rei", vec![Capability::ProductSearch])
                    .with_fallback_priority(0),
            )
            .with_agent(
                AgentDescriptor::new("backcountry", vec![Capability::ProductSearch])
                    .with_fallback_priority(1),
            )
            .build()
    }

    fn ids(descriptors: &[AgentDescriptor]) -> Vec<&str> {
        descriptors.iter().map(|d| d.agent_id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_by_capability_orders_by_priority() {
        let registry = registry();
        let agents = registry.list_by_capability(Capability::ProductSearch);
        assert_eq!(ids(&agents), vec!["rei", "backcountry", "evo"]);

        let price = registry.list_by_capability(Capability::PriceQuote);
        assert_eq!(ids(&price), vec!["evo"]);
        assert!(registry.list_by_capability(Capability::Reviews).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_before_degraded_at_same_priority() {
        let registry = registry();
        tokio::time::advance(Duration::from_secs(3)).await;
        // evo keeps heartbeating, backcountry goes quiet
        registry.mark_heartbeat("evo", Instant::now()).unwrap();
        registry.mark_heartbeat("rei", Instant::now()).unwrap();

        assert_eq!(registry.health("backcountry"), Some(HealthStatus::Degraded));
        let agents = registry.list_by_capability(Capability::ProductSearch);
        assert_eq!(ids(&agents), vec!["rei", "evo", "backcountry"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_only_when_no_alternative() {
        let registry = registry();
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.mark_heartbeat("rei", Instant::now()).unwrap();

        // evo and backcountry are unhealthy, rei is fine
        let agents = registry.list_by_capability(Capability::ProductSearch);
        assert_eq!(ids(&agents), vec!["rei"]);

        // Only evo offers price quotes, so it is still listed
        let price = registry.list_by_capability(Capability::PriceQuote);
        assert_eq!(ids(&price), vec!["evo"]);
        assert_eq!(price[0].health_status, HealthStatus::Unhealthy);
        assert!(!registry.is_routable("evo"));
    }

    #[rstest]
    #[case(0, HealthStatus::Healthy)]
    #[case(2_999, HealthStatus::Healthy)]
    #[case(3_000, HealthStatus::Degraded)]
    #[case(5_999, HealthStatus::Degraded)]
    #[case(6_000, HealthStatus::Unhealthy)]
    #[case(60_000, HealthStatus::Unhealthy)]
    #[tokio::test(start_paused = true)]
    async fn test_health_decay(#[case] silent_ms: u64, #[case] expected: HealthStatus) {
        let registry = registry();
        tokio::time::advance(Duration::from_millis(silent_ms)).await;
        assert_eq!(registry.health("evo"), Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_heartbeat_restores_health() {
        let registry = registry();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.health("evo"), Some(HealthStatus::Unhealthy));

        registry.mark_heartbeat("evo", Instant::now()).unwrap();
        assert_eq!(registry.health("evo"), Some(HealthStatus::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_is_idempotent_and_keeps_history() {
        let registry = registry();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(registry.health("evo"), Some(HealthStatus::Degraded));

        let updated = AgentDescriptor::new("evo", vec![Capability::Reviews]).with_fallback_priority(5);
        registry.register(updated.clone());
        registry.register(updated);

        assert_eq!(registry.len(), 3);
        let evo = registry.get("evo").unwrap();
        assert_eq!(evo.capabilities, vec![Capability::Reviews]);
        assert_eq!(evo.fallback_priority, 5);
        // Health history survives re-registration
        assert_eq!(evo.health_status, HealthStatus::Degraded);
    }

    #[test]
    fn test_heartbeat_from_unknown_agent() {
        let registry = AgentRegistry::default();
        let err = registry.mark_heartbeat("ghost", Instant::now()).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_heartbeats_reports_transitions_and_evicts() {
        let registry = AgentRegistryBuilder::new()
            .with_config(RegistryConfig {
                evict_after_missed: Some(10),
                ..config()
            })
            .with_agent(AgentDescriptor::new("a", vec![Capability::ProductSearch]))
            .with_agent(AgentDescriptor::new("b", vec![Capability::ProductSearch]))
            .build();

        tokio::time::advance(Duration::from_secs(3)).await;
        registry.mark_heartbeat("b", Instant::now()).unwrap();
        let report = registry.check_heartbeats(Instant::now());
        assert_eq!(
            report.transitions,
            vec![("a".to_string(), HealthStatus::Degraded)]
        );
        assert!(report.evicted.is_empty());

        tokio::time::advance(Duration::from_secs(7)).await;
        let report = registry.check_heartbeats(Instant::now());
        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_summary() {
        let registry = registry();
        assert_eq!(registry.health_summary().overall(), HealthStatus::Healthy);

        tokio::time::advance(Duration::from_secs(3)).await;
        registry.mark_heartbeat("rei", Instant::now()).unwrap();

        let summary = registry.health_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.degraded, 2);
        assert_eq!(summary.overall(), HealthStatus::Degraded);
        assert_eq!(HealthSummary::default().overall(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_deregister() {
        let registry = registry();
        assert!(registry.deregister("evo"));
        assert!(!registry.deregister("evo"));
        assert!(registry.get("evo").is_none());
        assert!(!registry.is_routable("evo"));
    }

    #[test]
    fn test_from_config_skips_disabled_agents() {
        let config: AgoraConfig = toml::from_str(
            r#"
[agents.evo]
capabilities = ["product_search"]
fallback_priority = 2

[agents.retired]
capabilities = ["product_search"]
enabled = false
"#,
        )
        .unwrap();

        let registry = AgentRegistry::from_config(&config);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("evo").unwrap().fallback_priority, 2);
    }
}
