//! Sub-agent registry (C5): a fixed mapping from agent name to a bounded,
//! total capability `execute(session_id, payload) -> output_object`.
//!
//! Every implementation here MUST be total on malformed input (returns
//! `{"error": ...}` rather than panicking) and MUST NOT retain per-request
//! state across invocations.

mod database_query;
mod report_synthesis;
mod retrieval_qa;
mod shell_tool;
mod web_search;

pub use database_query::DatabaseQueryAgent;
pub use report_synthesis::ReportSynthesisAgent;
pub use retrieval_qa::{LlmRagCollaborator, RagCollaborator, RetrievalQaAgent};
pub use shell_tool::ShellToolAgent;
pub use web_search::{GeneralWebSource, ScholarlySource, SearchSource, WebSearchAgent};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Default wall-time bound for network-bound sub-agents.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default wall-time bound for the shell tool.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(5);

/// A bounded capability invoked by the agent executor (C7).
#[async_trait]
pub trait SubAgent: Send + Sync {
    /// Name this agent is registered under; matches `PlanStep::agent_name`.
    fn name(&self) -> &'static str;

    /// Executes the agent against `payload`, always returning a mapping —
    /// failures are represented as `{"error": ...}`, never an exception.
    async fn execute(&self, session_id: &str, payload: &Map<String, Value>) -> Map<String, Value>;

    /// Wall-time bound applied by the executor around this call.
    fn timeout(&self) -> Duration {
        DEFAULT_NETWORK_TIMEOUT
    }
}

/// Builds a one-key `{"error": message}` output map, the uniform failure
/// shape every sub-agent returns instead of raising.
#[must_use]
pub fn error_map(message: impl Into<String>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("error".to_string(), Value::String(message.into()));
    map
}

/// Whether an output mapping counts as non-error (presence of a non-empty
/// `error` field disqualifies it, per the executor's adjudication rule).
#[must_use]
pub fn is_error_free(output: &Map<String, Value>) -> bool {
    match output.get("error") {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Fixed registry of the five sub-agents, keyed by name.
pub struct SubAgentRegistry {
    agents: HashMap<&'static str, Box<dyn SubAgent>>,
}

impl SubAgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Registers an agent under its own name, replacing any prior entry.
    pub fn register(&mut self, agent: Box<dyn SubAgent>) {
        self.agents.insert(agent.name(), agent);
    }

    /// Looks up an agent by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn SubAgent> {
        self.agents.get(name).map(std::convert::AsRef::as_ref)
    }

    /// Whether `name` is present in the registry.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }
}

impl Default for SubAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Required/optional parameter names per agent (§6.1), surfaced to the
/// parameter proposer as a schema hint.
#[must_use]
pub fn schema_hint(agent_name: &str) -> Value {
    match agent_name {
        "RetrievalQA" => serde_json::json!({"query": "string (derived from goal if missing)"}),
        "DatabaseQuery" => {
            serde_json::json!({"request": "string (NL to SQL)", "schema_hint": "string?"})
        }
        "WebSearch" => serde_json::json!({
            "query": "string",
            "sources": "[string]? (default general-web, scholarly)",
            "max_results": "int?",
            "last_days": "int?",
        }),
        "ShellTool" => serde_json::json!({
            "pattern": "string",
            "path": "string? (default .)",
            "max": "int? (default 200)",
        }),
        "ReportSynthesis" => serde_json::json!({"points": "object?", "data": "object?"}),
        _ => serde_json::json!({}),
    }
}

/// Built-in deterministic parameter fallback used when the proposer's C2
/// call fails entirely (§4.4 step 1).
#[must_use]
pub fn deterministic_fallback(agent_name: &str, goal: &str, last_keys: &[String]) -> Map<String, Value> {
    let mut map = Map::new();
    match agent_name {
        "RetrievalQA" | "WebSearch" => {
            map.insert("query".to_string(), Value::String(goal.to_string()));
        }
        "ReportSynthesis" => {
            let mut points = Map::new();
            points.insert("title".to_string(), Value::String(goal.to_string()));
            points.insert(
                "context".to_string(),
                Value::Array(last_keys.iter().cloned().map(Value::String).collect()),
            );
            map.insert("points".to_string(), Value::Object(points));
        }
        _ => {}
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_map_has_error_key() {
        let map = error_map("boom");
        assert_eq!(map.get("error"), Some(&Value::String("boom".to_string())));
    }

    #[test]
    fn test_is_error_free_rejects_non_empty_error() {
        let map = error_map("boom");
        assert!(!is_error_free(&map));
    }

    #[test]
    fn test_is_error_free_accepts_missing_error() {
        let mut map = Map::new();
        map.insert("answer".to_string(), Value::String("ok".to_string()));
        assert!(is_error_free(&map));
    }

    #[test]
    fn test_deterministic_fallback_retrieval_qa() {
        let fallback = deterministic_fallback("RetrievalQA", "find the docs", &[]);
        assert_eq!(fallback.get("query"), Some(&Value::String("find the docs".to_string())));
    }

    #[test]
    fn test_deterministic_fallback_report_synthesis_includes_context() {
        let fallback = deterministic_fallback(
            "ReportSynthesis",
            "summarize",
            &["step_1_RetrievalQA".to_string()],
        );
        let points = fallback.get("points").and_then(Value::as_object).unwrap_or_else(|| unreachable!());
        assert_eq!(points.get("title"), Some(&Value::String("summarize".to_string())));
    }

    #[test]
    fn test_registry_contains_after_register() {
        struct Dummy;
        #[async_trait]
        impl SubAgent for Dummy {
            fn name(&self) -> &'static str {
                "Dummy"
            }
            async fn execute(&self, _session_id: &str, _payload: &Map<String, Value>) -> Map<String, Value> {
                Map::new()
            }
        }
        let mut registry = SubAgentRegistry::new();
        assert!(!registry.contains("Dummy"));
        registry.register(Box::new(Dummy));
        assert!(registry.contains("Dummy"));
        assert!(registry.get("Dummy").is_some());
    }
}
