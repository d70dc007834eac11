//! Planner (C6): decomposes a goal into an ordered list of
//! `(sub-agent, input-template)` steps via C2, retrying on malformed output
//! and falling back to a fixed default plan when every attempt fails.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};
use crate::model::{Plan, PlanStep};
use crate::subagents::SubAgentRegistry;

const PLANNER_SYSTEM_PROMPT: &str = "You are a planner for a multi-agent task runner. \
Given a goal, decompose it into 3 to 6 ordered steps. Each step names one sub-agent and \
an initial input mapping (which may be empty and filled in later). Available sub-agents: \
RetrievalQA (answer from retrieval), DatabaseQuery (NL-to-SQL read-only lookups), \
WebSearch (general web and scholarly search), ShellTool (read-only text search over local \
files), ReportSynthesis (compose a brief from prior step output; typically last). \
Respond with strict JSON only, no prose, no markdown fences: \
{\"steps\": [{\"agent\": \"<name>\", \"input\": {}}, ...]}.";

/// Strips a single leading/trailing markdown code fence (` ```json ` or
/// ` ``` `) from `raw`, matching the existing lenient-parse idiom used
/// elsewhere in this crate for C2 output.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .strip_suffix("```")
        .unwrap_or(trimmed)
        .trim()
}

/// Parses one planner completion into a `Plan`, filtering unknown agents and
/// coercing missing/non-object inputs to `{}`. Accepts either the documented
/// `{"steps": [...]}` wrapper or a bare top-level array, per §4.2.1.
fn parse_plan(raw: &str, registry: &SubAgentRegistry) -> Option<Plan> {
    let cleaned = strip_fences(raw);
    let value: Value = serde_json::from_str(cleaned).ok()?;
    let steps = match &value {
        Value::Object(map) => map.get("steps").and_then(Value::as_array)?.clone(),
        Value::Array(items) => items.clone(),
        _ => return None,
    };

    let plan: Plan = steps
        .into_iter()
        .filter_map(|step| {
            let agent_name = step.get("agent").and_then(Value::as_str)?.to_string();
            if agent_name.is_empty() || !registry.contains(&agent_name) {
                return None;
            }
            let input_template = step
                .get("input")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Some(PlanStep {
                agent_name,
                input_template,
            })
        })
        .collect();

    if plan.is_empty() {
        None
    } else {
        Some(plan)
    }
}

/// The fixed plan returned when every planner attempt fails to produce a
/// usable JSON plan.
#[must_use]
pub fn default_fallback_plan(goal: &str) -> Plan {
    let mut query_input = serde_json::Map::new();
    query_input.insert("query".to_string(), Value::String(goal.to_string()));
    vec![
        PlanStep {
            agent_name: "RetrievalQA".to_string(),
            input_template: query_input,
        },
        PlanStep {
            agent_name: "ReportSynthesis".to_string(),
            input_template: serde_json::Map::new(),
        },
    ]
}

/// Produces a `Plan` for `goal`, retrying up to `max_attempts` times on
/// malformed C2 output before returning [`default_fallback_plan`].
pub async fn plan(
    provider: &Arc<dyn LlmProvider>,
    model: &str,
    goal: &str,
    registry: &SubAgentRegistry,
    max_attempts: u32,
) -> Plan {
    let mut previous_raw: Option<String> = None;

    for attempt in 1..=max_attempts.max(1) {
        let mut prompt = format!("Goal: {goal}");
        if let Some(prior) = &previous_raw {
            prompt.push_str(&format!(
                "\n\nRefine based on last failed attempt: {prior}"
            ));
        }

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![system_message(PLANNER_SYSTEM_PROMPT), user_message(&prompt)],
            temperature: Some(0.2),
            max_tokens: Some(1024),
            json_mode: true,
        };

        match provider.chat(&request).await {
            Ok(response) => {
                if let Some(plan) = parse_plan(&response.content, registry) {
                    debug!(attempt, steps = plan.len(), "planner produced usable plan");
                    return plan;
                }
                debug!(attempt, "planner output unusable, will retry");
                previous_raw = Some(response.content);
            }
            Err(error) => {
                debug!(attempt, %error, "planner C2 call failed, will retry");
                previous_raw = Some(error.to_string());
            }
        }
    }

    debug!("planner exhausted all attempts, using default fallback plan");
    default_fallback_plan(goal)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::RunnerError;
    use crate::llm::ChatResponse;
    use crate::llm::TokenUsage;
    use crate::subagents::{
        DatabaseQueryAgent, LlmRagCollaborator, RagCollaborator, ReportSynthesisAgent,
        RetrievalQaAgent, ShellToolAgent, WebSearchAgent,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn registry_with_known_agents() -> SubAgentRegistry {
        // A minimal registry sufficient for parse/filter tests: only agent
        // *names* matter here, not working implementations.
        struct NamedStub(&'static str);
        #[async_trait]
        impl crate::subagents::SubAgent for NamedStub {
            fn name(&self) -> &'static str {
                self.0
            }
            async fn execute(
                &self,
                _session_id: &str,
                _payload: &serde_json::Map<String, Value>,
            ) -> serde_json::Map<String, Value> {
                serde_json::Map::new()
            }
        }
        let mut registry = SubAgentRegistry::new();
        for name in ["RetrievalQA", "DatabaseQuery", "WebSearch", "ShellTool", "ReportSynthesis"] {
            registry.register(Box::new(NamedStub(name)));
        }
        registry
    }

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            let next = guard.pop().unwrap_or_else(|| Ok("{}".to_string()));
            match next {
                Ok(content) => Ok(ChatResponse {
                    content,
                    usage: TokenUsage::default(),
                    finish_reason: Some("stop".to_string()),
                }),
                Err(message) => Err(RunnerError::LlmRequest { message }),
            }
        }
    }

    #[test]
    fn test_parse_plan_wrapper_object() {
        let registry = registry_with_known_agents();
        let raw = r#"{"steps": [{"agent": "RetrievalQA", "input": {"query": "x"}}]}"#;
        let plan = parse_plan(raw, &registry).unwrap_or_else(|| panic!("expected plan"));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].agent_name, "RetrievalQA");
    }

    #[test]
    fn test_parse_plan_bare_array() {
        let registry = registry_with_known_agents();
        let raw = r#"[{"agent": "ShellTool", "input": {}}]"#;
        let plan = parse_plan(raw, &registry).unwrap_or_else(|| panic!("expected plan"));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_parse_plan_filters_unknown_agent() {
        let registry = registry_with_known_agents();
        let raw = r#"{"steps": [{"agent": "Unknown", "input": {}}, {"agent": "WebSearch", "input": {}}]}"#;
        let plan = parse_plan(raw, &registry).unwrap_or_else(|| panic!("expected plan"));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].agent_name, "WebSearch");
    }

    #[test]
    fn test_parse_plan_all_unknown_is_none() {
        let registry = registry_with_known_agents();
        let raw = r#"{"steps": [{"agent": "Unknown", "input": {}}]}"#;
        assert!(parse_plan(raw, &registry).is_none());
    }

    #[test]
    fn test_parse_plan_rejects_prose() {
        let registry = registry_with_known_agents();
        assert!(parse_plan("here is your plan: do stuff", &registry).is_none());
    }

    #[test]
    fn test_parse_plan_strips_code_fence() {
        let registry = registry_with_known_agents();
        let raw = "```json\n{\"steps\": [{\"agent\": \"RetrievalQA\", \"input\": {}}]}\n```";
        let plan = parse_plan(raw, &registry).unwrap_or_else(|| panic!("expected plan"));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_default_fallback_plan_shape() {
        let plan = default_fallback_plan("find the docs");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].agent_name, "RetrievalQA");
        assert_eq!(plan[1].agent_name, "ReportSynthesis");
        assert_eq!(
            plan[0].input_template.get("query"),
            Some(&Value::String("find the docs".to_string()))
        );
    }

    #[tokio::test]
    async fn test_plan_returns_first_successful_parse() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![Ok(
                r#"{"steps": [{"agent": "WebSearch", "input": {}}]}"#.to_string(),
            )]),
            calls: AtomicUsize::new(0),
        });
        let registry = registry_with_known_agents();
        let result = plan(&provider, "test-model", "goal", &registry, 3).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].agent_name, "WebSearch");
    }

    #[tokio::test]
    async fn test_plan_retries_then_succeeds() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![
                Ok(r#"{"steps": [{"agent": "WebSearch", "input": {}}]}"#.to_string()),
                Ok("not json at all".to_string()),
            ]),
            calls: AtomicUsize::new(0),
        });
        let registry = registry_with_known_agents();
        let result = plan(&provider, "test-model", "goal", &registry, 3).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].agent_name, "WebSearch");
    }

    #[tokio::test]
    async fn test_plan_exhausts_to_fallback() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![Ok("nope".to_string()), Ok("nope".to_string()), Ok("nope".to_string())]),
            calls: AtomicUsize::new(0),
        });
        let registry = registry_with_known_agents();
        let result = plan(&provider, "test-model", "goal text", &registry, 3).await;
        assert_eq!(result, default_fallback_plan("goal text"));
    }

    #[tokio::test]
    async fn test_plan_handles_llm_request_errors_via_retry() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![
                Ok(r#"{"steps": [{"agent": "ShellTool", "input": {}}]}"#.to_string()),
                Err("transport error".to_string()),
            ]),
            calls: AtomicUsize::new(0),
        });
        let registry = registry_with_known_agents();
        let result = plan(&provider, "test-model", "goal", &registry, 3).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].agent_name, "ShellTool");
    }

    // Smoke-test that the concrete sub-agent constructors used by the
    // orchestrator all satisfy `SubAgent`/`RagCollaborator`, independent of
    // the stubs used above for plan-parsing tests.
    #[test]
    fn test_concrete_agents_compile_against_registry() {
        fn _assert_registrable<T: crate::subagents::SubAgent + 'static>() {}
        _assert_registrable::<RetrievalQaAgent>();
        _assert_registrable::<DatabaseQueryAgent>();
        _assert_registrable::<WebSearchAgent>();
        _assert_registrable::<ShellToolAgent>();
        _assert_registrable::<ReportSynthesisAgent>();
        fn _assert_rag<T: RagCollaborator + 'static>() {}
        _assert_rag::<LlmRagCollaborator>();
    }
}
