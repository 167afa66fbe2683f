//! Agent backed by a local JSON item catalog
//!
//! The catalog file is a JSON array of items:
//!
//! ```json
//! [
//!   {"item_id": "burton-custom-158", "name": "Burton Custom Snowboard 158",
//!    "vendor": "evo", "price": 599.95, "rating": 4.6, "availability": "in_stock",
//!    "attributes": {"category": "snowboard", "flex": "medium"}}
//! ]
//! ```

use std::path::Path;

use async_trait::async_trait;

use super::Agent;
use crate::types::{AppError, Capability, Item, PartialResult, Result, SearchCriteria};

#[derive(Debug)]
pub struct CatalogAgent {
    agent_id: String,
    capabilities: Vec<Capability>,
    fallback_priority: u32,
    items: Vec<Item>,
}

impl CatalogAgent {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<Capability>, items: Vec<Item>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            fallback_priority: 0,
            items,
        }
    }

    pub fn from_file<P: AsRef<Path>>(
        agent_id: impl Into<String>,
        capabilities: Vec<Capability>,
        path: P,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("Cannot read catalog {:?}: {}", path, e))
        })?;
        let items: Vec<Item> = serde_json::from_str(&content).map_err(|e| {
            AppError::Configuration(format!("Invalid catalog {:?}: {}", path, e))
        })?;
        Ok(Self::new(agent_id, capabilities, items))
    }

    pub fn with_fallback_priority(mut self, priority: u32) -> Self {
        self.fallback_priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn matches(item: &Item, criteria: &SearchCriteria) -> bool {
        if !criteria.price_matches(item.price) {
            return false;
        }

        let haystack = searchable_text(item);

        if let Some(category) = &criteria.category {
            if !haystack.contains(&category.to_lowercase()) {
                return false;
            }
        }

        criteria.keywords.is_empty()
            || criteria
                .keywords
                .iter()
                .any(|keyword| haystack.contains(&keyword.to_lowercase()))
    }
}

/// Name, vendor and string attributes, lowercased
fn searchable_text(item: &Item) -> String {
    let mut text = format!("{} {}", item.name, item.vendor);
    for value in item.attributes.values() {
        if let Some(s) = value.as_str() {
            text.push(' ');
            text.push_str(s);
        }
    }
    text.to_lowercase()
}

#[async_trait]
impl Agent for CatalogAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn fallback_priority(&self) -> u32 {
        self.fallback_priority
    }

    async fn handle_request(&self, criteria: &SearchCriteria) -> Result<PartialResult> {
        let items = self
            .items
            .iter()
            .filter(|item| Self::matches(item, criteria))
            .take(criteria.max_results)
            .cloned()
            .collect();

        Ok(PartialResult {
            agent_id: self.agent_id.clone(),
            items,
            search_time_ms: 0,
        })
    }
}
