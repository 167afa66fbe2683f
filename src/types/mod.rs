use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Agents are addressed by a stable string id (e.g. `evo_com`).
pub type AgentId = String;

// ============= Capability Types =============

/// Fixed set of capability tags an agent can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ProductSearch,
    PriceQuote,
    Availability,
    Specifications,
    Reviews,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ProductSearch => "product_search",
            Capability::PriceQuote => "price_quote",
            Capability::Availability => "availability",
            Capability::Specifications => "specifications",
            Capability::Reviews => "reviews",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![
            Capability::ProductSearch,
            Capability::PriceQuote,
            Capability::Availability,
            Capability::Specifications,
            Capability::Reviews,
        ]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "product_search" | "search" => Ok(Capability::ProductSearch),
            "price_quote" | "price" => Ok(Capability::PriceQuote),
            "availability" | "stock" => Ok(Capability::Availability),
            "specifications" | "specs" => Ok(Capability::Specifications),
            "reviews" => Ok(Capability::Reviews),
            other => Err(AppError::InvalidInput(format!(
                "Unknown capability: {}. Use one of: product_search, price_quote, \
                 availability, specifications, reviews",
                other
            ))),
        }
    }
}

// ============= Health Types =============

/// Health as seen by the registry. Ordering follows preference: `Healthy < Degraded < Unhealthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// One level worse, saturating at `Unhealthy`.
    pub fn demote(self) -> Self {
        match self {
            HealthStatus::Healthy => HealthStatus::Degraded,
            HealthStatus::Degraded | HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        }
    }

    /// Whether the broker may route messages to an agent in this state.
    pub fn is_routable(self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

// ============= Message Types =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Status,
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank used by inbound queues; higher is delivered first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// Immutable envelope exchanged through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub recipients: Vec<String>,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    /// Id of the request this message answers (responses only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Deliver to registered recipients even when they are UNHEALTHY
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipients,
            message_type,
            payload,
            priority: Priority::default(),
            created_at: Utc::now(),
            timeout: Duration::from_secs(30),
            correlation_id: None,
            degraded: false,
        }
    }

    /// A REQUEST addressed to a single agent.
    pub fn request(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender, vec![recipient.into()], MessageType::Request, payload)
    }

    /// A RESPONSE routed back to the sender of `request`.
    pub fn response_to(
        request: &Message,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut message = Self::new(
            sender,
            vec![request.sender.clone()],
            MessageType::Response,
            payload,
        );
        message.priority = request.priority;
        message.timeout = request.timeout;
        message.correlation_id = Some(request.id);
        message
    }

    pub fn heartbeat(sender: impl Into<String>) -> Self {
        let mut message = Self::new(
            sender,
            Vec::new(),
            MessageType::Heartbeat,
            serde_json::Value::Null,
        );
        message.priority = Priority::Low;
        message
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow delivery to an UNHEALTHY recipient, for last-resort dispatch
    pub fn with_degraded_delivery(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }
}

// ============= Query Types =============

/// Structured search criteria produced by a query interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Normalized query text
    pub query: String,
    /// Capabilities an agent must offer to contribute
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::ProductSearch]
}

fn default_max_results() -> usize {
    20
}

impl SearchCriteria {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            capabilities: default_capabilities(),
            category: None,
            keywords: Vec::new(),
            min_price: None,
            max_price: None,
            max_results: default_max_results(),
        }
    }

    /// Whether `price` falls inside the requested range. Unknown prices always match.
    pub fn price_matches(&self, price: Option<f64>) -> bool {
        let Some(price) = price else {
            return true;
        };
        self.min_price.map_or(true, |min| price >= min)
            && self.max_price.map_or(true, |max| price <= max)
    }
}

/// Caller identity used for per-user cache variants and ranking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Stored in the USER cache tier, keyed by user id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub preferred_vendors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
    Limited,
    Backorder,
    #[default]
    Unknown,
}

/// One data item returned by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub name: String,
    pub vendor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(default)]
    pub availability: Availability,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    /// Fields that change quickly and belong in the LIVE tier.
    pub const VOLATILE_FIELDS: &'static [&'static str] = &["price", "availability"];

    /// The item without its volatile fields, as stored in the STATIC tier.
    pub fn descriptive(&self) -> serde_json::Value {
        Self::without_volatile(serde_json::to_value(self).unwrap_or(serde_json::Value::Null))
    }

    /// Strip volatile fields from an item-shaped JSON value.
    pub fn without_volatile(mut value: serde_json::Value) -> serde_json::Value {
        if let Some(object) = value.as_object_mut() {
            for field in Self::VOLATILE_FIELDS {
                object.remove(*field);
            }
        }
        value
    }
}

/// What a single agent produced for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub agent_id: AgentId,
    pub items: Vec<Item>,
    #[serde(default)]
    pub search_time_ms: u64,
}

/// Payload of a RESPONSE message sent by an agent host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentReply {
    Success { result: PartialResult },
    Error { message: String },
}

// ============= Response Types =============

/// States of the query coordination state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    Parsed,
    Dispatched,
    Awaiting,
    Aggregating,
    Ranked,
    Responded,
    Expired,
    Failed,
}

impl QueryState {
    /// `Expired` is not terminal: an expired session still aggregates what arrived.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Responded | QueryState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: QueryState,
    /// Milliseconds since the session was received
    pub at_ms: u64,
}

/// Where a returned item came from, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Live,
    CachedLive,
    CachedStatic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub item: serde_json::Value,
    pub item_id: String,
    pub agent_id: AgentId,
    pub source: ItemSource,
    /// True when part of the item could not be refreshed
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ResultItem {
    pub fn price(&self) -> Option<f64> {
        self.item.get("price").and_then(|p| p.as_f64())
    }

    pub fn rating(&self) -> Option<f64> {
        self.item.get("rating").and_then(|r| r.as_f64())
    }

    pub fn vendor(&self) -> Option<&str> {
        self.item.get("vendor").and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.item.get("name").and_then(|v| v.as_str())
    }
}

/// How one agent contributed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Success { items: usize },
    Failed { code: String, message: String },
    TimedOut { timeout_ms: u64 },
    CircuitOpen,
    /// Not dispatched (deadline too close or breadth limit)
    Skipped { reason: String },
    /// Still running when the session deadline fired
    Cancelled,
}

impl SourceStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SourceStatus::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub agent_id: AgentId,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Items recovered from cache because this agent was unavailable
    #[serde(default)]
    pub fallback_items: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Complete,
    Partial,
    NoDataAvailable,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseStatus::Complete => "complete",
            ResponseStatus::Partial => "partial",
            ResponseStatus::NoDataAvailable => "no_data_available",
        };
        f.write_str(name)
    }
}

/// Final answer returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: Uuid,
    pub query: String,
    pub status: ResponseStatus,
    pub results: Vec<ResultItem>,
    pub sources: Vec<SourceOutcome>,
    /// Served from the QUERY cache tier
    pub from_cache: bool,
    /// False when the ranker failed and results are in aggregation order
    pub ranked: bool,
    pub trace: Vec<StateTransition>,
    pub elapsed_ms: u64,
}

impl QueryResponse {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Outcomes keyed by agent id, for quick lookup.
    pub fn sources_by_agent(&self) -> HashMap<&str, &SourceOutcome> {
        self.sources
            .iter()
            .map(|s| (s.agent_id.as_str(), s))
            .collect()
    }
}

// ============= Error Types =============

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Could not understand query: {0}")]
    Interpretation(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Agent '{agent_id}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("Circuit open for agent '{0}'")]
    CircuitOpen(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Queue full for recipient '{0}'")]
    QueueFull(String),

    #[error("Ranking error: {0}")]
    Ranking(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Interpretation(_) => "interpretation_error",
            AppError::InvalidRecipient(_) => "invalid_recipient",
            AppError::AgentTimeout { .. } => "agent_timeout",
            AppError::CircuitOpen(_) => "circuit_open",
            AppError::Agent(_) => "agent_error",
            AppError::QueueFull(_) => "queue_full",
            AppError::Ranking(_) => "ranking_error",
            AppError::Configuration(_) => "configuration_error",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_parsing() {
        assert_eq!(
            "product-search".parse::<Capability>().unwrap(),
            Capability::ProductSearch
        );
        assert_eq!("specs".parse::<Capability>().unwrap(), Capability::Specifications);
        assert!("teleport".parse::<Capability>().is_err());
    }

    #[test]
    fn test_health_demotion_saturates() {
        assert_eq!(HealthStatus::Healthy.demote(), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.demote(), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unhealthy.demote(), HealthStatus::Unhealthy);
        assert!(HealthStatus::Degraded.is_routable());
        assert!(!HealthStatus::Unhealthy.is_routable());
    }

    #[test]
    fn test_response_correlates_to_request() {
        let request = Message::request("orchestrator", "evo_com", json!({"q": "board"}))
            .with_priority(Priority::High);
        let response = Message::response_to(&request, "evo_com", json!({}));

        assert_eq!(response.correlation_id, Some(request.id));
        assert_eq!(response.recipients, vec!["orchestrator".to_string()]);
        assert_eq!(response.priority, Priority::High);
        assert_eq!(response.message_type, MessageType::Response);
    }

    #[test]
    fn test_item_descriptive_drops_volatile_fields() {
        let item = Item {
            item_id: "burton-custom".to_string(),
            name: "Burton Custom".to_string(),
            vendor: "evo".to_string(),
            price: Some(499.0),
            url: None,
            rating: Some(4.5),
            availability: Availability::InStock,
            attributes: serde_json::Map::new(),
        };

        let descriptive = item.descriptive();
        assert!(descriptive.get("price").is_none());
        assert!(descriptive.get("availability").is_none());
        assert_eq!(descriptive["name"], "Burton Custom");
    }

    #[test]
    fn test_price_range_matching() {
        let mut criteria = SearchCriteria::new("snowboard");
        criteria.max_price = Some(500.0);

        assert!(criteria.price_matches(Some(499.99)));
        assert!(!criteria.price_matches(Some(650.0)));
        assert!(criteria.price_matches(None));
    }

    #[test]
    fn test_agent_reply_wire_format() {
        let reply = AgentReply::Error {
            message: "upstream 503".to_string(),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");

        let parsed: AgentReply = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, AgentReply::Error { .. }));
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            AppError::Interpretation("x".into()).code(),
            "interpretation_error"
        );
        assert_eq!(
            AppError::AgentTimeout {
                agent_id: "a".into(),
                timeout_ms: 10
            }
            .code(),
            "agent_timeout"
        );
        assert_eq!(AppError::CircuitOpen("a".into()).code(), "circuit_open");
    }
}
