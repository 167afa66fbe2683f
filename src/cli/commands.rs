//! Subcommand implementations

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use super::output::Output;
use crate::agents::{AgentHandle, AgentRuntime, CatalogAgent};
use crate::orchestrator::{Orchestrator, QueryOptions};
use crate::types::{ItemSource, QueryResponse, SourceStatus, UserContext};
use crate::utils::toml_config::{AgoraConfig, OrchestrationMode};
use crate::AppState;

/// Host every enabled agent that has a catalog file.
///
/// Relative catalog paths are resolved against `base_dir` (the directory of
/// the config file).
pub fn start_catalog_agents(
    state: &AppState,
    base_dir: &Path,
) -> anyhow::Result<Vec<AgentHandle>> {
    let mut handles = Vec::new();

    for (agent_id, agent) in state.config.agents.iter().filter(|(_, a)| a.enabled) {
        let Some(catalog) = &agent.catalog else {
            continue;
        };
        let path = if catalog.is_absolute() {
            catalog.clone()
        } else {
            base_dir.join(catalog)
        };

        let catalog_agent =
            CatalogAgent::from_file(agent_id.clone(), agent.capabilities.clone(), &path)
                .with_context(|| format!("Failed to load catalog for agent '{}'", agent_id))?
                .with_fallback_priority(agent.fallback_priority);

        tracing::debug!(agent_id = %agent_id, items = catalog_agent.len(), "Hosting catalog agent");
        handles.push(AgentRuntime::start(
            Arc::new(catalog_agent),
            Arc::clone(&state.broker),
        ));
    }

    Ok(handles)
}

/// Arguments of `agora query`
#[derive(Debug, Clone, Default)]
pub struct QueryArgs {
    pub text: String,
    pub user: Option<String>,
    pub deadline_ms: Option<u64>,
    pub mode: Option<OrchestrationMode>,
    pub json: bool,
}

pub async fn run_query(
    config: AgoraConfig,
    base_dir: &Path,
    args: QueryArgs,
    output: &Output,
) -> anyhow::Result<QueryResponse> {
    let state = AppState::from_config(config);
    let background = state.spawn_background_tasks();
    let handles = start_catalog_agents(&state, base_dir)?;

    let orchestrator = Orchestrator::builder(&state).build();
    let mut options = QueryOptions::default();
    if let Some(user) = args.user {
        options = options.with_user(UserContext::new(user));
    }
    if let Some(ms) = args.deadline_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }
    if let Some(mode) = args.mode {
        options = options.with_mode(mode);
    }

    let result = orchestrator.submit_with_options(&args.text, options).await;

    for handle in handles {
        handle.stop();
    }
    state.shutdown();
    for task in background {
        task.abort();
    }

    let response = result.context("Query failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response, output);
    }
    Ok(response)
}

pub fn print_response(response: &QueryResponse, output: &Output) {
    output.header(&format!("Results for \"{}\"", response.query));

    for (rank, result) in response.results.iter().enumerate() {
        let price = result
            .price()
            .map(|p| format!("${:.2}", p))
            .unwrap_or_else(|| "-".to_string());
        let source = match result.source {
            ItemSource::Live => "live",
            ItemSource::CachedLive => "cached",
            ItemSource::CachedStatic => "cached description",
        };
        let stale = if result.stale { ", stale" } else { "" };

        output.list_item(&format!(
            "{:>2}. {}  {}  {}  [{}{}]",
            rank + 1,
            result.name().unwrap_or(&result.item_id),
            price,
            result.vendor().unwrap_or(&result.agent_id),
            source,
            stale
        ));
    }

    output.subheader("Sources");
    output.table_header(&["Agent", "Status", "Attempts", "Elapsed", "From cache"]);
    for source in &response.sources {
        let attempts = source.attempts.to_string();
        let elapsed = format!("{}ms", source.elapsed_ms);
        let fallback = source.fallback_items.to_string();
        let status = source_label(&source.status);
        output.table_row(&[
            source.agent_id.as_str(),
            status.as_str(),
            attempts.as_str(),
            elapsed.as_str(),
            fallback.as_str(),
        ]);
    }

    output.newline();
    output.response_status(response.status, response.results.len(), response.elapsed_ms);
    if response.from_cache {
        output.info("Served from query cache");
    }
    if !response.ranked && !response.results.is_empty() {
        output.warning("Ranking unavailable, results are in arrival order");
    }
}

fn source_label(status: &SourceStatus) -> String {
    match status {
        SourceStatus::Success { items } => format!("ok ({})", items),
        SourceStatus::Failed { code, .. } => code.clone(),
        SourceStatus::TimedOut { timeout_ms } => format!("timeout {}ms", timeout_ms),
        SourceStatus::CircuitOpen => "circuit open".to_string(),
        SourceStatus::Skipped { .. } => "skipped".to_string(),
        SourceStatus::Cancelled => "cancelled".to_string(),
    }
}

pub fn list_agents(config: &AgoraConfig, output: &Output) {
    output.header("Agents");

    if config.agents.is_empty() {
        output.warning("No agents configured");
        output.hint("Add an [agents.<id>] section to agora.toml");
        return;
    }

    output.table_header(&["Agent", "Priority", "Enabled", "Capabilities"]);
    for (agent_id, agent) in &config.agents {
        let priority = agent.fallback_priority.to_string();
        let enabled = if agent.enabled { "yes" } else { "no" };
        let capabilities = agent
            .capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        output.table_row(&[agent_id.as_str(), priority.as_str(), enabled, capabilities.as_str()]);
    }
}

pub fn show_config(config: &AgoraConfig, path: &Path, validate: bool, output: &Output) -> anyhow::Result<()> {
    output.header("Configuration");
    output.kv("File", &path.display().to_string());
    output.kv("Mode", &format!("{:?}", config.orchestrator.mode));
    output.kv(
        "Deadline",
        &format!("{}ms", config.orchestrator.default_deadline_ms),
    );
    output.kv(
        "Agent timeout",
        &format!("{}ms", config.orchestrator.agent_timeout_ms),
    );
    output.kv(
        "Breaker",
        &format!(
            "{} failures, {}ms cooldown (max {}ms)",
            config.circuit_breaker.failure_threshold,
            config.circuit_breaker.cooldown_ms,
            config.circuit_breaker.max_cooldown_ms
        ),
    );
    output.kv(
        "Cache",
        if config.cache.enabled {
            "enabled"
        } else {
            "disabled"
        },
    );
    output.kv("Agents", &config.enabled_agents().join(", "));

    if validate {
        let warnings = config.validate_with_warnings()?;
        output.subheader("Validation");
        if warnings.is_empty() {
            output.success("Configuration is valid");
        } else {
            for warning in &warnings {
                output.warning(&warning.to_string());
            }
        }
    }
    Ok(())
}
