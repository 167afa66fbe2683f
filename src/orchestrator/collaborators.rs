//! Pluggable query interpreter and ranker
//!
//! The orchestrator only depends on the traits. [`KeywordInterpreter`] and
//! [`ScoreRanker`] are small rule-based defaults so the engine works end to end.

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;

use crate::types::{
    AppError, Availability, Capability, ResultItem, Result, SearchCriteria, UserContext,
    UserPreferences,
};

/// Turns free text into structured criteria
#[async_trait]
pub trait QueryInterpreter: Send + Sync {
    async fn interpret(&self, raw_query: &str) -> Result<SearchCriteria>;
}

/// Everything a ranker may take into account besides the items
#[derive(Debug, Clone, Copy)]
pub struct RankingContext<'a> {
    pub criteria: &'a SearchCriteria,
    pub user: Option<&'a UserContext>,
    pub preferences: Option<&'a UserPreferences>,
}

/// Orders merged items. Must only reorder or drop, never invent.
#[async_trait]
pub trait Ranker: Send + Sync {
    async fn rank(
        &self,
        items: Vec<ResultItem>,
        context: &RankingContext<'_>,
    ) -> Result<Vec<ResultItem>>;
}

// ============= Keyword Interpreter =============

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "for", "with", "of", "in", "on", "to", "me", "find", "show", "best",
    "good", "some", "i", "want", "need", "looking", "search", "get",
];

const MAX_PRICE_WORDS: &[&str] = &["under", "below", "max", "maximum", "less", "<"];
const MIN_PRICE_WORDS: &[&str] = &["over", "above", "min", "minimum", "more", ">"];

/// Rule-based interpreter: categories, price bounds and capability hints.
pub struct KeywordInterpreter {
    categories: Vec<String>,
    max_results: usize,
}

impl KeywordInterpreter {
    pub fn new() -> Self {
        Self {
            categories: [
                "snowboard", "ski", "boot", "binding", "jacket", "helmet", "goggle", "glove",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            max_results: 20,
        }
    }

    /// Replace the known category words (singular form)
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn category_of(&self, token: &str) -> Option<String> {
        let singular = token.strip_suffix('s').unwrap_or(token);
        self.categories
            .iter()
            .find(|c| c.as_str() == token || c.as_str() == singular)
            .cloned()
    }

    fn capability_hint(token: &str) -> Option<Capability> {
        match token {
            "price" | "prices" | "cost" | "cheap" | "cheapest" | "deal" | "deals" => {
                Some(Capability::PriceQuote)
            }
            "review" | "reviews" | "rated" | "rating" => Some(Capability::Reviews),
            "stock" | "available" | "availability" => Some(Capability::Availability),
            "spec" | "specs" | "specifications" => Some(Capability::Specifications),
            _ => None,
        }
    }

    fn parse(&self, raw_query: &str) -> Result<SearchCriteria> {
        let tokens: Vec<String> = raw_query
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric() && !matches!(c, '$' | '.' | '<' | '>'))
                    .trim_end_matches('.')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        let mut criteria = SearchCriteria::new(tokens.join(" "));
        criteria.max_results = self.max_results;
        let mut capabilities = vec![Capability::ProductSearch];
        let mut keywords = Vec::new();
        let mut consumed: HashSet<usize> = HashSet::new();

        for (index, token) in tokens.iter().enumerate() {
            if consumed.contains(&index) {
                continue;
            }

            // "less than 500" reads the same as "under 500"
            let price_at = match tokens.get(index + 1).map(String::as_str) {
                Some("than") => index + 2,
                _ => index + 1,
            };
            let next_price = tokens.get(price_at).and_then(|t| parse_price(t));

            if MAX_PRICE_WORDS.contains(&token.as_str()) {
                if let Some(price) = next_price {
                    criteria.max_price = Some(price);
                    consumed.insert(price_at);
                }
                continue;
            }
            if MIN_PRICE_WORDS.contains(&token.as_str()) {
                if let Some(price) = next_price {
                    criteria.min_price = Some(price);
                    consumed.insert(price_at);
                }
                continue;
            }
            if token.starts_with('$') {
                // A bare "$500" reads as a budget ceiling
                if let Some(price) = parse_price(token) {
                    criteria.max_price.get_or_insert(price);
                }
                continue;
            }
            if token == "than" || parse_price(token).is_some() {
                continue;
            }

            if let Some(capability) = Self::capability_hint(token) {
                if !capabilities.contains(&capability) {
                    capabilities.push(capability);
                }
                continue;
            }

            if criteria.category.is_none() {
                if let Some(category) = self.category_of(token) {
                    criteria.category = Some(category);
                    continue;
                }
            }

            if token.len() > 1 && !STOPWORDS.contains(&token.as_str()) && !keywords.contains(token) {
                keywords.push(token.clone());
            }
        }

        if criteria.category.is_none() && keywords.is_empty() {
            return Err(AppError::Interpretation(format!(
                "no searchable terms in '{}'",
                raw_query.trim()
            )));
        }

        if let (Some(min), Some(max)) = (criteria.min_price, criteria.max_price) {
            if min > max {
                return Err(AppError::Interpretation(format!(
                    "price range {}..{} is empty",
                    min, max
                )));
            }
        }

        criteria.capabilities = capabilities;
        criteria.keywords = keywords;
        Ok(criteria)
    }
}

impl Default for KeywordInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_price(token: &str) -> Option<f64> {
    token
        .trim_start_matches('$')
        .replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p >= 0.0)
}

#[async_trait]
impl QueryInterpreter for KeywordInterpreter {
    async fn interpret(&self, raw_query: &str) -> Result<SearchCriteria> {
        self.parse(raw_query)
    }
}

// ============= Score Ranker =============

/// Weighted score over keyword relevance, rating, vendor preference and budget.
pub struct ScoreRanker {
    pub relevance_weight: f32,
    pub rating_weight: f32,
    pub preferred_vendor_bonus: f32,
    pub within_budget_bonus: f32,
    pub stale_penalty: f32,
    pub unavailable_penalty: f32,
}

impl Default for ScoreRanker {
    fn default() -> Self {
        Self {
            relevance_weight: 2.0,
            rating_weight: 1.0,
            preferred_vendor_bonus: 0.5,
            within_budget_bonus: 0.25,
            stale_penalty: 0.25,
            unavailable_penalty: 0.5,
        }
    }
}

impl ScoreRanker {
    pub fn score(&self, item: &ResultItem, context: &RankingContext<'_>) -> f32 {
        let name = item.name().unwrap_or_default().to_lowercase();
        let keywords = &context.criteria.keywords;
        let relevance = if keywords.is_empty() {
            1.0
        } else {
            let hits = keywords.iter().filter(|k| name.contains(k.as_str())).count();
            hits as f32 / keywords.len() as f32
        };

        let rating = item.rating().map(|r| (r / 5.0) as f32).unwrap_or(0.0);
        let mut score = relevance * self.relevance_weight + rating * self.rating_weight;

        if let Some(preferences) = context.preferences {
            if let Some(vendor) = item.vendor() {
                if preferences
                    .preferred_vendors
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(vendor))
                {
                    score += self.preferred_vendor_bonus;
                }
            }
            if let (Some(budget), Some(price)) = (preferences.budget, item.price()) {
                if price <= budget {
                    score += self.within_budget_bonus;
                }
            }
        }

        if item.stale {
            score -= self.stale_penalty;
        }

        let availability = item
            .item
            .get("availability")
            .and_then(|a| serde_json::from_value::<Availability>(a.clone()).ok());
        if availability == Some(Availability::OutOfStock) {
            score -= self.unavailable_penalty;
        }

        score
    }
}

#[async_trait]
impl Ranker for ScoreRanker {
    async fn rank(
        &self,
        items: Vec<ResultItem>,
        context: &RankingContext<'_>,
    ) -> Result<Vec<ResultItem>> {
        let mut scored: Vec<ResultItem> = items
            .into_iter()
            .map(|mut item| {
                item.score = Some(self.score(&item, context));
                item
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_price(a.price(), b.price()))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        Ok(scored)
    }
}

/// Cheaper first, unknown prices last
fn compare_price(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemSource;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("burton snowboards under 500", Some("snowboard"), None, Some(500.0))]
    #[case("Ski boots over $300", Some("ski"), Some(300.0), None)]
    #[case("cheap helmet $120", Some("helmet"), None, Some(120.0))]
    #[case("jones mountain twin", None, None, None)]
    #[case("goggles less than 80", Some("goggle"), None, Some(80.0))]
    fn test_keyword_interpreter(
        #[case] query: &str,
        #[case] category: Option<&str>,
        #[case] min_price: Option<f64>,
        #[case] max_price: Option<f64>,
    ) {
        let criteria = KeywordInterpreter::new().parse(query).unwrap();
        assert_eq!(criteria.category.as_deref(), category);
        assert_eq!(criteria.min_price, min_price);
        assert_eq!(criteria.max_price, max_price);
        assert_eq!(criteria.capabilities[0], Capability::ProductSearch);
    }

    #[test]
    fn test_keywords_and_capability_hints() {
        let criteria = KeywordInterpreter::new()
            .parse("Best burton snowboard reviews and prices")
            .unwrap();

        assert_eq!(criteria.keywords, vec!["burton".to_string()]);
        assert_eq!(
            criteria.capabilities,
            vec![
                Capability::ProductSearch,
                Capability::Reviews,
                Capability::PriceQuote
            ]
        );
        assert_eq!(criteria.query, "best burton snowboard reviews and prices");
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("show me the best")]
    #[case("?? !!")]
    fn test_uninterpretable_queries(#[case] query: &str) {
        let err = KeywordInterpreter::new().parse(query).unwrap_err();
        assert_eq!(err.code(), "interpretation_error");
    }

    #[test]
    fn test_custom_categories_and_result_cap() {
        let interpreter = KeywordInterpreter::new()
            .with_categories(vec!["Wax".to_string()])
            .with_max_results(5);

        let criteria = interpreter.parse("Wax under 20").unwrap();
        assert_eq!(criteria.category.as_deref(), Some("wax"));
        assert_eq!(criteria.max_results, 5);

        // Default categories are gone
        let criteria = interpreter.parse("snowboards").unwrap();
        assert_eq!(criteria.category, None);
        assert_eq!(criteria.keywords, vec!["snowboards".to_string()]);
    }

    #[test]
    fn test_empty_price_range_is_rejected() {
        assert!(KeywordInterpreter::new()
            .parse("snowboard over 600 under 300")
            .is_err());
    }

    fn result_item(id: &str, name: &str, vendor: &str, price: f64, rating: f64) -> ResultItem {
        ResultItem {
            item: json!({"name": name, "vendor": vendor, "price": price, "rating": rating}),
            item_id: id.to_string(),
            agent_id: vendor.to_string(),
            source: ItemSource::Live,
            stale: false,
            score: None,
        }
    }

    #[tokio::test]
    async fn test_score_ranker_orders_by_relevance_then_rating() {
        let mut criteria = SearchCriteria::new("burton custom");
        criteria.keywords = vec!["burton".to_string(), "custom".to_string()];
        let context = RankingContext {
            criteria: &criteria,
            user: None,
            preferences: None,
        };

        let ranked = ScoreRanker::default()
            .rank(
                vec![
                    result_item("a", "Jones Frontier", "rei", 499.0, 5.0),
                    result_item("b", "Burton Custom", "evo", 599.0, 4.0),
                    result_item("c", "Burton Process", "evo", 449.0, 4.5),
                ],
                &context,
            )
            .await
            .unwrap();

        let ids: Vec<_> = ranked.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(ranked.iter().all(|r| r.score.is_some()));
    }

    #[tokio::test]
    async fn test_preferred_vendor_and_stale_penalty() {
        let criteria = SearchCriteria::new("snowboard");
        let preferences = UserPreferences {
            preferred_vendors: vec!["REI".to_string()],
            budget: None,
        };
        let user = UserContext::new("u1");
        let context = RankingContext {
            criteria: &criteria,
            user: Some(&user),
            preferences: Some(&preferences),
        };

        let mut stale = result_item("evo-1", "Board", "evo", 400.0, 4.0);
        stale.stale = true;
        let ranked = ScoreRanker::default()
            .rank(
                vec![stale, result_item("rei-1", "Board", "rei", 400.0, 4.0)],
                &context,
            )
            .await
            .unwrap();

        assert_eq!(ranked[0].item_id, "rei-1");
    }

    #[test]
    fn test_price_tiebreak() {
        assert_eq!(compare_price(Some(1.0), Some(2.0)), Ordering::Less);
        assert_eq!(compare_price(None, Some(2.0)), Ordering::Greater);
    }
}
