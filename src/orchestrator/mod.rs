//! Query orchestrator
//!
//! Drives one query through the coordination state machine:
//!
//! ```text
//! RECEIVED -> PARSED -> DISPATCHED -> AWAITING -> AGGREGATING -> RANKED -> RESPONDED
//!    |          |           |            |
//!    |          v           +--> EXPIRED-+--> AGGREGATING (with what arrived)
//!    |        FAILED
//!    +--(QUERY cache hit)--> RESPONDED
//! ```
//!
//! Each agent request runs on its own task and reports back over one channel.
//! Requests are cut off at the deadline minus a safety margin, so a hung agent
//! is reported as timed out within its own session; the session keeps
//! listening for half the margin longer to collect those reports. EXPIRED is
//! only reached if a report still fails to arrive by then.
//!
//! Agents that fail, time out or sit behind an open circuit are covered from
//! cache: a cached LIVE snapshot first, then (in `maximum_reliability` mode)
//! the STATIC description. Nothing is ever synthesized. An UNHEALTHY agent is
//! only asked when no healthier agent offers the capability.

pub mod collaborators;
pub mod session;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakers};
use crate::agents::registry::{AgentDescriptor, AgentRegistry};
use crate::broker::MessageBroker;
use crate::cache::{
    criteria_fingerprint, item_index_key, item_key, query_key, user_key, Assembled, CacheStore,
    CacheTier, TierLookup,
};
use crate::types::{
    AgentId, AgentReply, AppError, HealthStatus, Item, ItemSource, Message, PartialResult, Priority,
    QueryResponse, QueryState, ResponseStatus, Result, ResultItem, SearchCriteria, SourceOutcome,
    SourceStatus, UserContext, UserPreferences,
};
use crate::utils::toml_config::{OrchestrationMode, OrchestratorConfig};
use crate::AppState;

pub use collaborators::{KeywordInterpreter, QueryInterpreter, Ranker, RankingContext, ScoreRanker};
pub use session::QuerySession;

/// Per-query overrides
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub user: Option<UserContext>,
    /// Overall budget; defaults to `orchestrator.default_deadline_ms`
    pub deadline: Option<Duration>,
    /// Defaults to `orchestrator.mode`
    pub mode: Option<OrchestrationMode>,
    /// Priority of the REQUEST messages sent to agents
    pub priority: Priority,
}

impl QueryOptions {
    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_mode(mut self, mode: OrchestrationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A query running in the background
pub struct QueryHandle {
    session_id: Uuid,
    task: JoinHandle<Result<QueryResponse>>,
}

impl QueryHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abandon the query. Dispatched agent calls still settle their breakers.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn wait(self) -> Result<QueryResponse> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Query task failed: {}", e)))?
    }
}

/// One agent call about to go out
struct Dispatch {
    agent_id: AgentId,
    breaker: Arc<CircuitBreaker>,
    permit: CallPermit,
    /// Last-resort call to an UNHEALTHY agent
    degraded: bool,
}

/// What one dispatch task reports back to its session
#[derive(Debug)]
struct DispatchReport {
    agent_id: AgentId,
    result: Result<PartialResult>,
    attempts: u32,
    elapsed_ms: u64,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    broker: Arc<MessageBroker>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<dyn CacheStore>,
    interpreter: Arc<dyn QueryInterpreter>,
    ranker: Arc<dyn Ranker>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder(state: &AppState) -> OrchestratorBuilder {
        OrchestratorBuilder::new(state)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Answer `raw_query` within `deadline` (or the configured default).
    pub async fn submit_query(
        &self,
        raw_query: &str,
        user: Option<UserContext>,
        deadline: Option<Duration>,
    ) -> Result<QueryResponse> {
        let options = QueryOptions {
            user,
            deadline,
            ..Default::default()
        };
        self.submit_with_options(raw_query, options).await
    }

    pub async fn submit_with_options(
        &self,
        raw_query: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        self.run(Uuid::new_v4(), raw_query, options).await
    }

    /// Start a query on its own task and return immediately
    pub fn submit_query_detached(
        &self,
        raw_query: impl Into<String>,
        options: QueryOptions,
    ) -> QueryHandle {
        let session_id = Uuid::new_v4();
        let orchestrator = self.clone();
        let raw_query = raw_query.into();
        let task =
            tokio::spawn(async move { orchestrator.run(session_id, &raw_query, options).await });
        QueryHandle { session_id, task }
    }

    /// Store preferences the ranker will see for `user`
    pub fn remember_preferences(&self, user: &UserContext, preferences: &UserPreferences) -> Result<()> {
        let value = serde_json::to_value(preferences)?;
        self.cache.put(&user_key(&user.user_id), value, CacheTier::User);
        Ok(())
    }

    async fn run(
        &self,
        session_id: Uuid,
        raw_query: &str,
        options: QueryOptions,
    ) -> Result<QueryResponse> {
        let budget = options
            .deadline
            .unwrap_or_else(|| self.config.default_deadline());
        let mode = options.mode.unwrap_or(self.config.mode);
        let user = options.user.as_ref();
        let mut session = QuerySession::new(session_id, raw_query, budget);

        info!(
            session_id = %session_id,
            query = raw_query,
            ?mode,
            budget_ms = budget.as_millis() as u64,
            "Query received"
        );

        // RECEIVED: a cached answer short-circuits everything
        if let Some(cached) = self.lookup_cached(raw_query, user) {
            session.transition(QueryState::Responded)?;
            return Ok(QueryResponse {
                session_id,
                query: raw_query.to_string(),
                from_cache: true,
                trace: session.trace().to_vec(),
                elapsed_ms: session.elapsed_ms(),
                ..cached
            });
        }

        // PARSED
        session.transition(QueryState::Parsed)?;
        let criteria = match self.interpret(&session).await {
            Ok(criteria) => criteria,
            Err(e) => {
                warn!(session_id = %session_id, "Interpretation failed: {}", e);
                session.transition(QueryState::Failed)?;
                return Err(e);
            }
        };
        session.criteria = Some(criteria.clone());

        // DISPATCHED
        let margin = self.config.deadline_margin();
        let cutoff = session
            .deadline()
            .checked_sub(margin)
            .unwrap_or_else(Instant::now);
        let listen_until = session
            .deadline()
            .checked_sub(margin / 2)
            .unwrap_or(cutoff);
        let payload = serde_json::to_value(&criteria)?;
        let selected = self.select_agents(&criteria, mode);
        let (tx, mut rx) = mpsc::channel(selected.len().max(1));
        let mut in_flight = 0usize;

        for agent in &selected {
            let outcome = |status| SourceOutcome {
                agent_id: agent.agent_id.clone(),
                status,
                attempts: 0,
                elapsed_ms: 0,
                fallback_items: 0,
            };

            if cutoff.saturating_duration_since(Instant::now()).is_zero() {
                session.record_outcome(outcome(SourceStatus::Skipped {
                    reason: "deadline too close to dispatch".to_string(),
                }));
                continue;
            }

            let breaker = self.breakers.get(&agent.agent_id);
            let Some(permit) = breaker.try_acquire() else {
                debug!(agent_id = %agent.agent_id, "Circuit open, skipping dispatch");
                session.record_outcome(outcome(SourceStatus::CircuitOpen));
                continue;
            };

            let degraded = agent.health_status == HealthStatus::Unhealthy;
            if degraded {
                info!(agent_id = %agent.agent_id, "Dispatching to unhealthy agent as last resort");
            }

            // Replaced when the dispatch task reports back
            session.record_outcome(outcome(SourceStatus::Cancelled));
            self.spawn_dispatch(
                Dispatch {
                    agent_id: agent.agent_id.clone(),
                    breaker,
                    permit,
                    degraded,
                },
                payload.clone(),
                cutoff,
                options.priority,
                tx.clone(),
            );
            in_flight += 1;
        }
        drop(tx);
        session.transition(QueryState::Dispatched)?;
        info!(
            session_id = %session_id,
            selected = selected.len(),
            dispatched = in_flight,
            "Requests dispatched"
        );

        // AWAITING
        session.transition(QueryState::Awaiting)?;
        let mut expired = false;
        while in_flight > 0 {
            match tokio::time::timeout_at(listen_until, rx.recv()).await {
                Ok(Some(report)) => {
                    in_flight -= 1;
                    Self::apply_report(&mut session, report);
                }
                Ok(None) => break,
                Err(_) => {
                    expired = true;
                    break;
                }
            }
        }
        if expired {
            warn!(
                session_id = %session_id,
                outstanding = in_flight,
                "Deadline reached with agents still outstanding"
            );
            session.transition(QueryState::Expired)?;
        }

        // AGGREGATING
        session.transition(QueryState::Aggregating)?;
        let unavailable = session.unavailable_agents();
        if !unavailable.is_empty() {
            info!(session_id = %session_id, ?unavailable, "Covering unavailable agents from cache");
        }
        let results = self.aggregate(&mut session, &criteria, mode);

        if results.is_empty() {
            session.transition(QueryState::Responded)?;
            info!(session_id = %session_id, "No data available from any source");
            return Ok(QueryResponse {
                session_id,
                query: raw_query.to_string(),
                status: ResponseStatus::NoDataAvailable,
                results,
                sources: session.outcomes.clone(),
                from_cache: false,
                ranked: false,
                trace: session.trace().to_vec(),
                elapsed_ms: session.elapsed_ms(),
            });
        }

        // RANKED
        let preferences = user.and_then(|u| self.load_preferences(u));
        let context = RankingContext {
            criteria: &criteria,
            user,
            preferences: preferences.as_ref(),
        };
        let (mut results, ranked) = self.rank(&session, results, &context).await;
        results.truncate(criteria.max_results);
        session.transition(QueryState::Ranked)?;

        // RESPONDED
        let status = if session.outcomes.iter().all(|o| o.status.is_success()) {
            ResponseStatus::Complete
        } else {
            ResponseStatus::Partial
        };
        session.transition(QueryState::Responded)?;

        let response = QueryResponse {
            session_id,
            query: raw_query.to_string(),
            status,
            results,
            sources: session.outcomes.clone(),
            from_cache: false,
            ranked,
            trace: session.trace().to_vec(),
            elapsed_ms: session.elapsed_ms(),
        };
        self.store_response(&response, user);

        info!(
            session_id = %session_id,
            %status,
            results = response.results.len(),
            elapsed_ms = response.elapsed_ms,
            "Query answered"
        );
        Ok(response)
    }

    fn lookup_cached(&self, raw_query: &str, user: Option<&UserContext>) -> Option<QueryResponse> {
        let mut keys = Vec::with_capacity(2);
        if let Some(user) = user {
            keys.push(query_key(raw_query, Some(&user.user_id)));
        }
        keys.push(query_key(raw_query, None));

        keys.iter()
            .find_map(|key| self.cache.get(key, CacheTier::Query))
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn store_response(&self, response: &QueryResponse, user: Option<&UserContext>) {
        let value = match serde_json::to_value(response) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to cache response: {}", e);
                return;
            }
        };

        if let Some(user) = user {
            self.cache.put(
                &query_key(&response.query, Some(&user.user_id)),
                value.clone(),
                CacheTier::Query,
            );
        }
        self.cache
            .put(&query_key(&response.query, None), value, CacheTier::Query);
    }

    fn load_preferences(&self, user: &UserContext) -> Option<UserPreferences> {
        self.cache
            .get(&user_key(&user.user_id), CacheTier::User)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    async fn interpret(&self, session: &QuerySession) -> Result<SearchCriteria> {
        let budget = self.config.interpreter_timeout().min(session.remaining());

        match tokio::time::timeout(budget, self.interpreter.interpret(&session.raw_query)).await {
            Ok(Ok(criteria)) => Ok(criteria),
            Ok(Err(AppError::Interpretation(message))) => Err(AppError::Interpretation(message)),
            Ok(Err(e)) => Err(AppError::Interpretation(e.to_string())),
            Err(_) => Err(AppError::Interpretation(format!(
                "interpreter did not answer within {}ms",
                budget.as_millis()
            ))),
        }
    }

    /// Capable agents in fallback order, deduplicated across capabilities
    fn select_agents(&self, criteria: &SearchCriteria, mode: OrchestrationMode) -> Vec<AgentDescriptor> {
        let breadth = match mode {
            OrchestrationMode::Optimized => self.config.optimized_breadth,
            OrchestrationMode::MaximumReliability => usize::MAX,
        };

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for capability in &criteria.capabilities {
            for agent in self
                .registry
                .list_by_capability(*capability)
                .into_iter()
                .take(breadth)
            {
                if seen.insert(agent.agent_id.clone()) {
                    selected.push(agent);
                }
            }
        }
        selected
    }

    /// Run one agent call (plus retries) on its own task. Every attempt must
    /// settle by `cutoff`, which lies strictly before the session deadline.
    fn spawn_dispatch(
        &self,
        dispatch: Dispatch,
        payload: serde_json::Value,
        cutoff: Instant,
        priority: Priority,
        tx: mpsc::Sender<DispatchReport>,
    ) {
        let broker = Arc::clone(&self.broker);
        let sender = self.config.endpoint.clone();
        let agent_timeout = self.config.agent_timeout();
        let retries = self.config.agent_retries;

        let Dispatch {
            agent_id,
            breaker,
            mut permit,
            degraded,
        } = dispatch;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut attempts = 0u32;

            let result = loop {
                attempts += 1;
                let timeout = agent_timeout.min(cutoff.saturating_duration_since(Instant::now()));
                let message = Message::request(sender.clone(), agent_id.clone(), payload.clone())
                    .with_priority(priority)
                    .with_timeout(timeout)
                    .with_degraded_delivery(degraded);

                let result = match broker.request(message, timeout).await {
                    Ok(response) => decode_reply(response),
                    Err(e) => Err(e),
                };

                match breaker_verdict(&result) {
                    Some(success) => breaker.record_outcome(permit, success),
                    None => {
                        debug!(agent_id = %agent_id, "Request never reached the agent");
                        breaker.release(permit);
                    }
                }

                let time_left = !cutoff.saturating_duration_since(Instant::now()).is_zero();
                if result.is_ok() || attempts > retries || !time_left {
                    break result;
                }
                match breaker.try_acquire() {
                    Some(next) => permit = next,
                    None => break result,
                }
                debug!(agent_id = %agent_id, attempts, "Retrying agent request");
            };

            let report = DispatchReport {
                agent_id,
                result,
                attempts,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if tx.send(report).await.is_err() {
                debug!("Session finished before dispatch report arrived");
            }
        });
    }

    fn apply_report(session: &mut QuerySession, report: DispatchReport) {
        let status = match &report.result {
            Ok(partial) => SourceStatus::Success {
                items: partial.items.len(),
            },
            Err(AppError::AgentTimeout { timeout_ms, .. }) => {
                warn!(agent_id = %report.agent_id, timeout_ms, "Agent timed out");
                SourceStatus::TimedOut {
                    timeout_ms: *timeout_ms,
                }
            }
            Err(e) => {
                warn!(agent_id = %report.agent_id, code = e.code(), "Agent failed: {}", e);
                SourceStatus::Failed {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }
            }
        };

        if let Some(outcome) = session.outcome_mut(&report.agent_id) {
            outcome.status = status;
            outcome.attempts = report.attempts;
            outcome.elapsed_ms = report.elapsed_ms;
        }
        if let Ok(partial) = report.result {
            session.partials.insert(report.agent_id, partial);
        }
    }

    /// Live items first (written through to LIVE and STATIC), then cache fallbacks
    /// for every agent that produced nothing.
    fn aggregate(
        &self,
        session: &mut QuerySession,
        criteria: &SearchCriteria,
        mode: OrchestrationMode,
    ) -> Vec<ResultItem> {
        let fingerprint = criteria_fingerprint(criteria);
        let mut results = Vec::new();

        let agent_order: Vec<AgentId> = session.outcomes.iter().map(|o| o.agent_id.clone()).collect();
        for agent_id in agent_order {
            match session.partials.get(&agent_id) {
                Some(partial) => {
                    let items = self.absorb_live(&agent_id, &partial.items, &fingerprint);
                    results.extend(items);
                }
                None => {
                    let recovered = self.recover_from_cache(&agent_id, &fingerprint, mode);
                    if !recovered.is_empty() {
                        debug!(
                            agent_id = %agent_id,
                            items = recovered.len(),
                            "Recovered items from cache"
                        );
                    }
                    if let Some(outcome) = session.outcome_mut(&agent_id) {
                        outcome.fallback_items = recovered.len();
                    }
                    results.extend(recovered);
                }
            }
        }
        results
    }

    fn absorb_live(&self, agent_id: &str, items: &[Item], fingerprint: &str) -> Vec<ResultItem> {
        let mut results = Vec::with_capacity(items.len());
        let mut item_ids = Vec::with_capacity(items.len());

        for item in items {
            let live = match serde_json::to_value(item) {
                Ok(value) => value,
                Err(e) => {
                    warn!(agent_id, item_id = %item.item_id, "Skipping unserializable item: {}", e);
                    continue;
                }
            };

            let key = item_key(agent_id, &item.item_id);
            self.cache.put(&key, live.clone(), CacheTier::Live);

            // Fill fields the live feed left out from what STATIC already knows
            let merged = match self.cache.assemble(
                &key,
                &[
                    TierLookup::required(CacheTier::Live),
                    TierLookup::optional(CacheTier::Static),
                ],
            ) {
                Assembled::Hit { value, .. } => value,
                Assembled::Miss => live,
            };
            self.cache
                .put(&key, Item::without_volatile(merged.clone()), CacheTier::Static);

            item_ids.push(item.item_id.clone());
            results.push(ResultItem {
                item: merged,
                item_id: item.item_id.clone(),
                agent_id: agent_id.to_string(),
                source: ItemSource::Live,
                stale: false,
                score: None,
            });
        }

        self.cache.put(
            &item_index_key(agent_id, fingerprint),
            json!(item_ids),
            CacheTier::Static,
        );
        results
    }

    fn recover_from_cache(
        &self,
        agent_id: &str,
        fingerprint: &str,
        mode: OrchestrationMode,
    ) -> Vec<ResultItem> {
        let item_ids: Vec<String> = self
            .cache
            .get(&item_index_key(agent_id, fingerprint), CacheTier::Static)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        let mut recovered = Vec::new();
        for item_id in item_ids {
            let key = item_key(agent_id, &item_id);

            let live = self.cache.assemble(
                &key,
                &[
                    TierLookup::required(CacheTier::Live),
                    TierLookup::optional(CacheTier::Static),
                ],
            );
            let (value, source, stale) = match live {
                Assembled::Hit { value, missing } => (value, ItemSource::CachedLive, !missing.is_empty()),
                Assembled::Miss if mode == OrchestrationMode::MaximumReliability => {
                    match self
                        .cache
                        .assemble(&key, &[TierLookup::required(CacheTier::Static)])
                    {
                        Assembled::Hit { value, .. } => (value, ItemSource::CachedStatic, true),
                        Assembled::Miss => continue,
                    }
                }
                Assembled::Miss => continue,
            };

            recovered.push(ResultItem {
                item: value,
                item_id,
                agent_id: agent_id.to_string(),
                source,
                stale,
                score: None,
            });
        }
        recovered
    }

    /// Ranked results, or the aggregation order with `false` if the ranker
    /// fails, times out or returns items it was not given.
    async fn rank(
        &self,
        session: &QuerySession,
        results: Vec<ResultItem>,
        context: &RankingContext<'_>,
    ) -> (Vec<ResultItem>, bool) {
        let budget = self.config.ranker_timeout().min(session.remaining());
        if budget.is_zero() {
            warn!(session_id = %session.id, "No time left to rank results");
            return (results, false);
        }

        match tokio::time::timeout(budget, self.ranker.rank(results.clone(), context)).await {
            Ok(Ok(ranked)) if only_known_items(&results, &ranked) => (ranked, true),
            Ok(Ok(_)) => {
                warn!(session_id = %session.id, "Ranker returned items it was not given");
                (results, false)
            }
            Ok(Err(e)) => {
                warn!(session_id = %session.id, "Ranking failed: {}", e);
                (results, false)
            }
            Err(_) => {
                warn!(
                    session_id = %session.id,
                    budget_ms = budget.as_millis() as u64,
                    "Ranker timed out"
                );
                (results, false)
            }
        }
    }
}

fn decode_reply(response: Message) -> Result<PartialResult> {
    match serde_json::from_value::<AgentReply>(response.payload) {
        Ok(AgentReply::Success { result }) => Ok(result),
        Ok(AgentReply::Error { message }) => Err(AppError::Agent(message)),
        Err(e) => Err(AppError::Agent(format!("Malformed reply from {}: {}", response.sender, e))),
    }
}

/// Whether `result` says anything about the agent itself. Only an answer,
/// an agent error or a timeout moves the breaker; a request the broker
/// refused (`InvalidRecipient`, `QueueFull`) never reached the agent.
fn breaker_verdict(result: &Result<PartialResult>) -> Option<bool> {
    match result {
        Ok(_) => Some(true),
        Err(AppError::AgentTimeout { .. } | AppError::Agent(_)) => Some(false),
        Err(_) => None,
    }
}

fn only_known_items(given: &[ResultItem], ranked: &[ResultItem]) -> bool {
    let known: HashSet<(&str, &str)> = given
        .iter()
        .map(|r| (r.agent_id.as_str(), r.item_id.as_str()))
        .collect();
    ranked.len() <= given.len()
        && ranked
            .iter()
            .all(|r| known.contains(&(r.agent_id.as_str(), r.item_id.as_str())))
}

/// Builder for an [`Orchestrator`] over shared [`AppState`] handles
pub struct OrchestratorBuilder {
    registry: Arc<AgentRegistry>,
    broker: Arc<MessageBroker>,
    breakers: Arc<CircuitBreakers>,
    cache: Arc<dyn CacheStore>,
    interpreter: Option<Arc<dyn QueryInterpreter>>,
    ranker: Option<Arc<dyn Ranker>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new(state: &AppState) -> Self {
        Self {
            registry: Arc::clone(&state.registry),
            broker: Arc::clone(&state.broker),
            breakers: Arc::clone(&state.breakers),
            cache: state.cache.clone(),
            interpreter: None,
            ranker: None,
            config: state.config.orchestrator.clone(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn QueryInterpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    pub fn with_ranker(mut self, ranker: Arc<dyn Ranker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different cache store than the shared tiered cache
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            registry: self.registry,
            broker: self.broker,
            breakers: self.breakers,
            cache: self.cache,
            interpreter: self
                .interpreter
                .unwrap_or_else(|| Arc::new(KeywordInterpreter::default())),
            ranker: self
                .ranker
                .unwrap_or_else(|| Arc::new(ScoreRanker::default())),
            config: self.config,
        }
    }
}
