//! Per-agent circuit breakers
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(cool-down)--> HALF_OPEN
//!    ^                                  ^                       |
//!    +--------(trial succeeds)----------|-----------------------+
//!                                       +--(trial fails, cool-down doubled)
//! ```
//!
//! Every transition happens inside one `parking_lot::Mutex` critical section;
//! the lock is never held across an await.
//!
//! Callers that may report late use [`CircuitBreaker::try_acquire`] and hand the
//! returned [`CallPermit`] back with the outcome. While HALF_OPEN only the
//! permit of the trial call can settle the breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::AgentId;
use crate::utils::toml_config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub agent_id: AgentId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time since the breaker last opened
    pub opened_ms_ago: Option<u64>,
    pub cooldown_ms: u64,
}

/// Admission ticket for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPermit {
    generation: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    /// Bumped each time a trial call is granted
    generation: u64,
}

pub struct CircuitBreaker {
    agent_id: AgentId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<AgentId>, config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                generation: 0,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Whether a call may go out now.
    ///
    /// Once the cool-down has elapsed the first caller moves the breaker to
    /// HALF_OPEN and gets the single trial call; everyone else is refused until
    /// that trial is recorded.
    pub fn allow_call(&self) -> bool {
        self.try_acquire().is_some()
    }

    /// Like [`allow_call`](Self::allow_call), returning a permit that ties the
    /// eventual outcome to this admission.
    pub fn try_acquire(&self) -> Option<CallPermit> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit {
                generation: inner.generation,
            }),
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| Instant::now() >= opened + inner.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.generation += 1;
                info!(agent_id = %self.agent_id, "Circuit half-open, allowing trial call");
                Some(CallPermit {
                    generation: inner.generation,
                })
            }
        }
    }

    /// Settle the call admitted by `permit`. In HALF_OPEN, outcomes of calls
    /// other than the trial are ignored.
    pub fn record_outcome(&self, permit: CallPermit, success: bool) {
        self.settle(Some(permit), success);
    }

    /// Give back a permit whose call never reached the agent. A released
    /// trial returns the breaker to OPEN, already cooled down, so the next
    /// caller gets a fresh trial.
    pub fn release(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && permit.generation == inner.generation {
            inner.state = CircuitState::Open;
            debug!(agent_id = %self.agent_id, "Trial call released unused");
        }
    }

    pub fn record_success(&self) {
        self.settle(None, true);
    }

    pub fn record_failure(&self) {
        self.settle(None, false);
    }

    fn settle(&self, permit: Option<CallPermit>, success: bool) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen
            && permit.is_some_and(|p| p.generation != inner.generation)
        {
            debug!(agent_id = %self.agent_id, "Ignoring outcome of a call admitted before the trial");
            return;
        }

        if success {
            Self::on_success(&self.agent_id, &self.config, &mut inner);
        } else {
            Self::on_failure(&self.agent_id, &self.config, &mut inner);
        }
    }

    fn on_success(agent_id: &str, config: &CircuitBreakerConfig, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.cooldown = config.cooldown();
                info!(agent_id, "Circuit closed after successful trial");
            }
            // Late result from a call made before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn on_failure(agent_id: &str, config: &CircuitBreakerConfig, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        agent_id,
                        failures = inner.consecutive_failures,
                        cooldown_ms = inner.cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.cooldown = (inner.cooldown * 2).min(config.max_cooldown());
                warn!(
                    agent_id,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "Trial call failed, circuit re-opened"
                );
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            agent_id: self.agent_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_ms_ago: inner
                .opened_at
                .map(|opened| Instant::now().saturating_duration_since(opened).as_millis() as u64),
            cooldown_ms: inner.cooldown.as_millis() as u64,
        }
    }

    /// Force the breaker back to CLOSED
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.cooldown = self.config.cooldown();
    }
}

/// One breaker per agent, created on first use.
pub struct CircuitBreakers {
    breakers: RwLock<HashMap<AgentId, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(agent_id) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(agent_id, self.config.clone()))),
        )
    }

    /// Snapshots sorted by agent id
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        snapshots
    }

    /// Close one breaker. Returns false if the agent has none yet.
    pub fn reset(&self, agent_id: &str) -> bool {
        match self.breakers.read().get(agent_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "evo",
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 1_000,
                max_cooldown_ms: 3_000,
            },
        )
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            assert!(breaker.allow_call());
            breaker.record_failure();
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_call());
    }

    #[test]
    fn test_success_in_closed_resets_counter() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_grants_single_trial() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!breaker.allow_call());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow_call());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes_and_zeroes_counter() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.allow_call());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.allow_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_doubles_cooldown_up_to_cap() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.allow_call());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().cooldown_ms, 2_000);

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(!breaker.allow_call());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow_call());
        breaker.record_failure();
        assert_eq!(breaker.snapshot().cooldown_ms, 3_000);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(breaker.allow_call());
        breaker.record_failure();
        assert_eq!(breaker.snapshot().cooldown_ms, 3_000);
    }

    #[test]
    fn test_outcomes_while_open_are_ignored() {
        let breaker = breaker();
        trip(&breaker);
        let before = breaker.snapshot();

        breaker.record_failure();
        breaker.record_success();

        let after = breaker.snapshot();
        assert_eq!(after.state, CircuitState::Open);
        assert_eq!(after.consecutive_failures, before.consecutive_failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_trial_permit_settles_half_open() {
        let breaker = breaker();
        let early = breaker.try_acquire().unwrap();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert_ne!(early, trial);

        // A success from before the circuit opened arrives late
        breaker.record_outcome(early, true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_call());

        breaker.record_outcome(trial, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_trial_permit_is_ignored_after_reopen() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(1)).await;
        let first_trial = breaker.try_acquire().unwrap();
        breaker.record_outcome(first_trial, false);

        tokio::time::advance(Duration::from_secs(2)).await;
        let second_trial = breaker.try_acquire().unwrap();
        breaker.record_outcome(first_trial, false);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().cooldown_ms, 2_000);

        breaker.record_outcome(second_trial, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_is_granted_again() {
        let breaker = breaker();
        let closed = breaker.try_acquire().unwrap();
        breaker.release(closed);
        assert_eq!(breaker.state(), CircuitState::Closed);

        trip(&breaker);
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        breaker.release(trial);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().cooldown_ms, 1_000);
        let retrial = breaker.try_acquire().unwrap();
        breaker.record_outcome(retrial, true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_collection_creates_lazily_and_resets() {
        let breakers = CircuitBreakers::default();
        assert!(!breakers.reset("evo"));

        let evo = breakers.get("evo");
        assert!(Arc::ptr_eq(&evo, &breakers.get("evo")));

        for _ in 0..3 {
            evo.record_failure();
        }
        assert_eq!(breakers.snapshot()[0].state, CircuitState::Open);

        assert!(breakers.reset("evo"));
        assert_eq!(evo.state(), CircuitState::Closed);
    }
}
