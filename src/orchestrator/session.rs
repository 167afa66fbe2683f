//! Per-query state: criteria, deadline, partial results and the transition trace.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    AgentId, AppError, PartialResult, QueryState, Result, SearchCriteria, SourceOutcome,
    StateTransition,
};

/// Lives for exactly one `submit_query` call.
#[derive(Debug)]
pub struct QuerySession {
    pub id: Uuid,
    pub raw_query: String,
    pub criteria: Option<SearchCriteria>,
    started_at: Instant,
    deadline: Instant,
    state: QueryState,
    trace: Vec<StateTransition>,
    /// Successful agent results keyed by agent id
    pub partials: BTreeMap<AgentId, PartialResult>,
    /// Every agent that was considered, in dispatch order
    pub outcomes: Vec<SourceOutcome>,
}

impl QuerySession {
    pub fn new(id: Uuid, raw_query: impl Into<String>, budget: Duration) -> Self {
        let started_at = Instant::now();
        let mut session = Self {
            id,
            raw_query: raw_query.into(),
            criteria: None,
            started_at,
            deadline: started_at + budget,
            state: QueryState::Received,
            trace: Vec::new(),
            partials: BTreeMap::new(),
            outcomes: Vec::new(),
        };
        session.record(QueryState::Received);
        session
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the overall deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn trace(&self) -> &[StateTransition] {
        &self.trace
    }

    /// Move to `next`, rejecting moves the state machine does not allow.
    pub fn transition(&mut self, next: QueryState) -> Result<()> {
        if !is_allowed(self.state, next) {
            return Err(AppError::Internal(format!(
                "Invalid session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        self.record(next);

        if next.is_terminal() {
            info!(
                session_id = %self.id,
                state = ?next,
                elapsed_ms = self.elapsed_ms(),
                "Session finished"
            );
        } else {
            debug!(session_id = %self.id, state = ?next, "Session transition");
        }
        Ok(())
    }

    pub fn record_outcome(&mut self, outcome: SourceOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn outcome_mut(&mut self, agent_id: &str) -> Option<&mut SourceOutcome> {
        self.outcomes.iter_mut().find(|o| o.agent_id == agent_id)
    }

    /// Agents with no usable live result
    pub fn unavailable_agents(&self) -> Vec<AgentId> {
        self.outcomes
            .iter()
            .filter(|o| !o.status.is_success())
            .map(|o| o.agent_id.clone())
            .collect()
    }

    fn record(&mut self, state: QueryState) {
        self.trace.push(StateTransition {
            state,
            at_ms: self.elapsed_ms(),
        });
    }
}

fn is_allowed(from: QueryState, to: QueryState) -> bool {
    use QueryState::*;

    matches!(
        (from, to),
        (Received, Parsed)
            | (Received, Responded)
            | (Parsed, Failed)
            | (Parsed, Dispatched)
            | (Dispatched, Awaiting)
            | (Dispatched, Expired)
            | (Awaiting, Aggregating)
            | (Awaiting, Expired)
            // An expired session still assembles whatever arrived in time
            | (Expired, Aggregating)
            | (Aggregating, Ranked)
            | (Aggregating, Responded)
            | (Ranked, Responded)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_trace() {
        let mut session = QuerySession::new(Uuid::new_v4(), "boards", Duration::from_secs(1));
        for state in [
            QueryState::Parsed,
            QueryState::Dispatched,
            QueryState::Awaiting,
            QueryState::Aggregating,
            QueryState::Ranked,
            QueryState::Responded,
        ] {
            session.transition(state).unwrap();
        }

        let states: Vec<_> = session.trace().iter().map(|t| t.state).collect();
        assert_eq!(states.len(), 7);
        assert_eq!(states[0], QueryState::Received);
        assert_eq!(session.state(), QueryState::Responded);
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        let mut session = QuerySession::new(Uuid::new_v4(), "boards", Duration::from_secs(1));
        assert!(session.transition(QueryState::Awaiting).is_err());
        assert!(session.transition(QueryState::Failed).is_err());

        session.transition(QueryState::Parsed).unwrap();
        session.transition(QueryState::Failed).unwrap();
        assert!(session.transition(QueryState::Dispatched).is_err());
    }

    #[test]
    fn test_expired_then_aggregating() {
        let mut session = QuerySession::new(Uuid::new_v4(), "boards", Duration::from_secs(1));
        session.transition(QueryState::Parsed).unwrap();
        session.transition(QueryState::Dispatched).unwrap();
        session.transition(QueryState::Awaiting).unwrap();
        session.transition(QueryState::Expired).unwrap();
        session.transition(QueryState::Aggregating).unwrap();
        session.transition(QueryState::Responded).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_budget() {
        let session = QuerySession::new(Uuid::new_v4(), "boards", Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(session.remaining(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(session.remaining(), Duration::ZERO);
    }
}
