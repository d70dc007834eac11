//! Agent Executor (C7): runs one plan step with parameter proposal, success
//! adjudication, bounded retries, and per-attempt tracing.
//!
//! `rusqlite::Connection` is `!Send`, so every lesson-store access here is
//! scoped to end before the next `.await`, matching the pattern already
//! established in `subagents::database_query`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::debug;

use crate::embedding::Embedder;
use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};
use crate::model::{truncate_preview, Lesson, LessonStatus, PlanStep, RunContext, StepAttempt, StepTrace};
use crate::storage::{LessonMatch, SqliteStorage};
use crate::subagents::{deterministic_fallback, error_map, is_error_free, schema_hint, SubAgentRegistry};

const PROPOSER_SYSTEM_PROMPT: &str = "You complete missing parameters for a sub-agent call in a \
multi-agent task runner. Given the agent's schema, the goal, recent context keys, prior working \
parameters, and patterns to avoid, return a strict JSON object of parameter values only \
(no wrapper, no prose, no markdown fences) matching the schema's field names.";

/// Maximum back-off between retries, in seconds (§4.4 step 5).
const MAX_BACKOFF_SECS: f64 = 2.0;
/// Step of linear back-off growth per attempt, in seconds.
const BACKOFF_STEP_SECS: f64 = 0.5;
/// Number of agent-specific lessons retrieved to seed the proposer (§4.4 step 1).
const LESSON_TOP_K: usize = 5;
/// Number of success/fail lessons surfaced into the proposer prompt.
const LESSON_HINT_COUNT: usize = 3;

/// Whether `payload` already carries the fields this agent needs to run,
/// so the parameter proposer can be skipped for this attempt.
fn has_required_fields(agent_name: &str, payload: &Map<String, Value>) -> bool {
    fn non_empty_str(payload: &Map<String, Value>, keys: &[&str]) -> bool {
        keys.iter()
            .any(|k| payload.get(*k).and_then(Value::as_str).is_some_and(|s| !s.is_empty()))
    }
    match agent_name {
        "RetrievalQA" => non_empty_str(payload, &["query", "question"]),
        "DatabaseQuery" => non_empty_str(payload, &["request", "query"]),
        "WebSearch" => non_empty_str(payload, &["query"]),
        "ShellTool" => non_empty_str(payload, &["pattern"]),
        "ReportSynthesis" => ["points", "data", "payload"].iter().any(|k| payload.contains_key(*k)),
        _ => true,
    }
}

/// Adjudicates whether an already-error-free output counts as a successful
/// step, per the agent-specific predicates in §4.4 step 3.
fn adjudicate(agent_name: &str, output: &Map<String, Value>, websearch_scholarly_min: usize) -> bool {
    match agent_name {
        "RetrievalQA" => output.get("answer").and_then(Value::as_str).is_some_and(|s| !s.is_empty()),
        "ReportSynthesis" => output.get("report").and_then(Value::as_str).is_some_and(|s| !s.is_empty()),
        "DatabaseQuery" => output.contains_key("headers") || output.contains_key("rows"),
        "ShellTool" => {
            output.get("exit_code").and_then(Value::as_i64) == Some(0)
                || output.get("output").and_then(Value::as_str).is_some_and(|s| !s.is_empty())
        }
        "WebSearch" => output
            .get("scholarly")
            .and_then(Value::as_object)
            .and_then(|scholarly| scholarly.get("entries"))
            .and_then(Value::as_array)
            .is_some_and(|entries| entries.len() >= websearch_scholarly_min),
        _ => true,
    }
}

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

/// One failed attempt carried forward as a refinement hint for the next.
struct PriorAttempt<'a> {
    input: &'a Map<String, Value>,
    output: &'a Map<String, Value>,
}

/// Looks up agent-specific lessons for `goal`, never failing: embedding or
/// storage errors simply yield an empty lesson set (soft failure, §4.8).
fn lookup_lessons(
    embedder: &dyn Embedder,
    storage: &Arc<Mutex<SqliteStorage>>,
    agent_name: &str,
    goal: &str,
) -> Vec<LessonMatch> {
    let Some(embedding) = embedder.embed(goal) else {
        return Vec::new();
    };
    let result = {
        let storage = match storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        storage.lesson_top_k_similar(&embedding, Some(agent_name), LESSON_TOP_K)
    };
    match result {
        Ok(matches) => matches,
        Err(error) => {
            debug!(%error, agent_name, "lesson lookup failed, proceeding without seed lessons");
            Vec::new()
        }
    }
}

/// Persists a lesson, swallowing any storage failure (§4.8 best-effort).
fn persist_lesson(storage: &Arc<Mutex<SqliteStorage>>, lesson: &Lesson) {
    let result = {
        let mut storage = match storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        storage.lesson_insert(lesson)
    };
    if let Err(error) = result {
        debug!(%error, agent_name = %lesson.agent_name, "lesson insert failed, continuing");
    }
}

/// Proposes a completed parameter mapping for one attempt: fills any field
/// missing from `template` using, in priority order, the first matching
/// success lesson then a strict-JSON completion from C2 (C2 wins overlaps),
/// falling back to a deterministic per-agent template if C2 fails entirely.
#[allow(clippy::too_many_arguments)]
async fn propose_payload(
    provider: &Arc<dyn LlmProvider>,
    proposer_model: &str,
    agent_name: &str,
    goal: &str,
    template: &Map<String, Value>,
    context_keys: &[String],
    lessons: &[LessonMatch],
    prior: Option<&PriorAttempt<'_>>,
) -> Map<String, Value> {
    let success_params: Vec<&Map<String, Value>> = lessons
        .iter()
        .filter(|m| m.lesson.status == LessonStatus::Success)
        .filter_map(|m| m.lesson.working_params.as_ref())
        .take(LESSON_HINT_COUNT)
        .collect();
    let avoid_patterns: Vec<&str> = lessons
        .iter()
        .filter(|m| m.lesson.status == LessonStatus::Fail)
        .filter_map(|m| m.lesson.fix_summary.as_deref())
        .take(LESSON_HINT_COUNT)
        .collect();

    let mut request_payload = serde_json::json!({
        "agent_name": agent_name,
        "goal": goal,
        "schema_hint": schema_hint(agent_name),
        "context_keys": context_keys,
        "success_params": success_params,
        "avoid_patterns": avoid_patterns,
    });
    if let Some(prior) = prior {
        request_payload["last_attempt"] = serde_json::json!({
            "input": prior.input,
            "output": prior.output,
        });
    }

    let request = ChatRequest {
        model: proposer_model.to_string(),
        messages: vec![
            system_message(PROPOSER_SYSTEM_PROMPT),
            user_message(&serde_json::to_string_pretty(&request_payload).unwrap_or_default()),
        ],
        temperature: Some(0.1),
        max_tokens: Some(512),
        json_mode: true,
    };

    let c2_result = provider.chat(&request).await.ok().and_then(|response| {
        let cleaned = strip_fences(&response.content);
        serde_json::from_str::<Value>(cleaned)
            .ok()
            .and_then(|v| v.as_object().cloned())
    });

    let mut proposed = match c2_result {
        Some(c2_obj) => {
            let mut base = success_params.first().map(|m| (*m).clone()).unwrap_or_default();
            for (k, v) in c2_obj {
                base.insert(k, v);
            }
            base
        }
        None => deterministic_fallback(agent_name, goal, context_keys),
    };

    let mut payload = template.clone();
    for (k, v) in proposed.drain(..) {
        payload.entry(k).or_insert(v);
    }
    payload
}

/// Runs one plan step to completion (success or attempt exhaustion),
/// returning the final output object and the full per-attempt trace.
pub struct AgentExecutor {
    registry: Arc<SubAgentRegistry>,
    proposer_provider: Arc<dyn LlmProvider>,
    proposer_model: String,
    embedder: Arc<dyn Embedder>,
    storage: Arc<Mutex<SqliteStorage>>,
    max_attempts: usize,
    websearch_scholarly_min: usize,
    agent_timeout_cap: Duration,
}

impl std::fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("proposer_model", &self.proposer_model)
            .field("max_attempts", &self.max_attempts)
            .field("websearch_scholarly_min", &self.websearch_scholarly_min)
            .field("agent_timeout_cap", &self.agent_timeout_cap)
            .finish_non_exhaustive()
    }
}

impl AgentExecutor {
    /// Creates an executor over the shared registry, generative model,
    /// embedder, and memory store.
    ///
    /// `agent_timeout_cap` bounds every sub-agent call from above: the
    /// executor waits for `min(agent.timeout(), agent_timeout_cap)`, so a
    /// configured value tighter than an agent's own default (30s network,
    /// 5s shell) takes effect, while a looser one leaves each agent's
    /// default bound unchanged.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SubAgentRegistry>,
        proposer_provider: Arc<dyn LlmProvider>,
        proposer_model: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        storage: Arc<Mutex<SqliteStorage>>,
        max_attempts: usize,
        websearch_scholarly_min: usize,
        agent_timeout_cap: Duration,
    ) -> Self {
        Self {
            registry,
            proposer_provider,
            proposer_model: proposer_model.into(),
            embedder,
            storage,
            max_attempts: max_attempts.max(1),
            websearch_scholarly_min,
            agent_timeout_cap,
        }
    }

    /// Executes `plan_step` against `context`, retrying with refined
    /// parameters up to `max_attempts` times. Never panics or propagates a
    /// sub-agent failure: the executor always returns a final output map
    /// (possibly `{"error": ...}`) and a complete trace.
    pub async fn execute_step(
        &self,
        session_id: &str,
        goal: &str,
        step_index: usize,
        plan_step: &PlanStep,
        context: &RunContext,
    ) -> (Map<String, Value>, StepTrace) {
        let Some(agent) = self.registry.get(&plan_step.agent_name) else {
            let output = error_map(format!("unknown sub-agent: {}", plan_step.agent_name));
            let attempt = StepAttempt {
                attempt_index: 1,
                input: plan_step.input_template.clone(),
                success: false,
                elapsed_seconds: 0.0,
                output_preview: truncate_preview(&serde_json::to_string(&output).unwrap_or_default()),
            };
            return (
                output,
                StepTrace {
                    agent_name: plan_step.agent_name.clone(),
                    attempts: vec![attempt],
                    final_success: false,
                },
            );
        };

        let lessons = lookup_lessons(self.embedder.as_ref(), &self.storage, &plan_step.agent_name, goal);
        let context_keys = context.last_keys(8);
        let context_view = serde_json::to_value(context.as_view()).unwrap_or(Value::Null);

        let mut attempts = Vec::with_capacity(self.max_attempts);
        let mut last_output = Map::new();
        let mut prior: Option<(Map<String, Value>, Map<String, Value>)> = None;
        let mut final_success = false;

        for attempt_index in 1..=self.max_attempts {
            let prior_hint = prior.as_ref().map(|(input, output)| PriorAttempt { input, output });
            let mut payload = if has_required_fields(&plan_step.agent_name, &plan_step.input_template) && prior_hint.is_none() {
                plan_step.input_template.clone()
            } else {
                propose_payload(
                    &self.proposer_provider,
                    &self.proposer_model,
                    &plan_step.agent_name,
                    goal,
                    &plan_step.input_template,
                    &context_keys,
                    &lessons,
                    prior_hint.as_ref(),
                )
                .await
            };
            let input_without_context = payload.clone();
            payload.insert("context".to_string(), context_view.clone());

            let start = Instant::now();
            let call_timeout = agent.timeout().min(self.agent_timeout_cap);
            let output = match tokio::time::timeout(call_timeout, agent.execute(session_id, &payload)).await {
                Ok(output) => output,
                Err(_) => error_map("timeout"),
            };
            let elapsed_seconds = start.elapsed().as_secs_f64();

            let success = is_error_free(&output) && adjudicate(&plan_step.agent_name, &output, self.websearch_scholarly_min);
            let preview = truncate_preview(&serde_json::to_string(&output).unwrap_or_default());
            attempts.push(StepAttempt {
                attempt_index,
                input: input_without_context.clone(),
                success,
                elapsed_seconds,
                output_preview: preview,
            });

            debug!(
                step_index,
                agent = %plan_step.agent_name,
                attempt = attempt_index,
                success,
                "step attempt finished"
            );

            last_output = output.clone();
            if success {
                final_success = true;
                let lesson = Lesson {
                    lesson_id: uuid::Uuid::new_v4().to_string(),
                    trigger_embedding: self.embedder.embed(goal).unwrap_or_default(),
                    goal_text: goal.to_string(),
                    agent_name: plan_step.agent_name.clone(),
                    status: LessonStatus::Success,
                    error_snippet: None,
                    fix_summary: None,
                    working_params: Some(input_without_context),
                };
                if !lesson.trigger_embedding.is_empty() {
                    persist_lesson(&self.storage, &lesson);
                }
                break;
            }

            prior = Some((input_without_context, output));
            if attempt_index < self.max_attempts {
                let backoff = (BACKOFF_STEP_SECS * f64::from(u32::try_from(attempt_index).unwrap_or(u32::MAX))).min(MAX_BACKOFF_SECS);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
        }

        if !final_success {
            let error_snippet = last_output
                .get("error")
                .and_then(Value::as_str)
                .map(|s| truncate_preview(s))
                .or_else(|| Some(truncate_preview(&serde_json::to_string(&last_output).unwrap_or_default())));
            let lesson = Lesson {
                lesson_id: uuid::Uuid::new_v4().to_string(),
                trigger_embedding: self.embedder.embed(goal).unwrap_or_default(),
                goal_text: goal.to_string(),
                agent_name: plan_step.agent_name.clone(),
                status: LessonStatus::Fail,
                error_snippet,
                fix_summary: None,
                working_params: None,
            };
            if !lesson.trigger_embedding.is_empty() {
                persist_lesson(&self.storage, &lesson);
            }
        }

        (
            last_output,
            StepTrace {
                agent_name: plan_step.agent_name.clone(),
                attempts,
                final_success,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::embedding::DeterministicEmbedder;
    use crate::error::RunnerError;
    use crate::llm::{ChatResponse, TokenUsage};
    use crate::subagents::SubAgent;

    struct AlwaysOkAgent;
    #[async_trait]
    impl SubAgent for AlwaysOkAgent {
        fn name(&self) -> &'static str {
            "RetrievalQA"
        }
        async fn execute(&self, _session_id: &str, _payload: &Map<String, Value>) -> Map<String, Value> {
            let mut map = Map::new();
            map.insert("answer".to_string(), Value::String("42".to_string()));
            map
        }
    }

    struct FailsOnceAgent {
        calls: std::sync::atomic::AtomicUsize,
    }
    #[async_trait]
    impl SubAgent for FailsOnceAgent {
        fn name(&self) -> &'static str {
            "WebSearch"
        }
        async fn execute(&self, _session_id: &str, _payload: &Map<String, Value>) -> Map<String, Value> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                error_map("transient failure")
            } else {
                let mut scholarly = Map::new();
                scholarly.insert(
                    "entries".to_string(),
                    Value::Array((0..5).map(|_| Value::Object(Map::new())).collect()),
                );
                let mut map = Map::new();
                map.insert("scholarly".to_string(), Value::Object(scholarly));
                map
            }
        }
    }

    struct AlwaysErrorAgent;
    #[async_trait]
    impl SubAgent for AlwaysErrorAgent {
        fn name(&self) -> &'static str {
            "DatabaseQuery"
        }
        async fn execute(&self, _session_id: &str, _payload: &Map<String, Value>) -> Map<String, Value> {
            error_map("generated SQL invalid: not a read-only SELECT")
        }
    }

    struct NullProvider;
    #[async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, RunnerError> {
            Err(RunnerError::LlmRequest {
                message: "no provider configured in test".to_string(),
            })
        }
    }

    fn test_executor(registry: SubAgentRegistry, max_attempts: usize) -> AgentExecutor {
        let storage = SqliteStorage::in_memory().unwrap_or_else(|e| panic!("{e}"));
        let mut storage = storage;
        storage.init().unwrap_or_else(|e| panic!("{e}"));
        AgentExecutor::new(
            Arc::new(registry),
            Arc::new(NullProvider),
            "test-model",
            Arc::new(DeterministicEmbedder),
            Arc::new(Mutex::new(storage)),
            max_attempts,
            5,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_with_complete_template() {
        let mut registry = SubAgentRegistry::new();
        registry.register(Box::new(AlwaysOkAgent));
        let executor = test_executor(registry, 3);
        let mut input_template = Map::new();
        input_template.insert("query".to_string(), Value::String("q".to_string()));
        let step = PlanStep {
            agent_name: "RetrievalQA".to_string(),
            input_template,
        };
        let (output, trace) = executor
            .execute_step("s1", "find the answer", 1, &step, &RunContext::new())
            .await;
        assert!(trace.final_success);
        assert_eq!(trace.attempts.len(), 1);
        assert_eq!(output.get("answer"), Some(&Value::String("42".to_string())));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut registry = SubAgentRegistry::new();
        registry.register(Box::new(FailsOnceAgent {
            calls: std::sync::atomic::AtomicUsize::new(0),
        }));
        let executor = test_executor(registry, 3);
        let mut input_template = Map::new();
        input_template.insert("query".to_string(), Value::String("recent papers".to_string()));
        let step = PlanStep {
            agent_name: "WebSearch".to_string(),
            input_template,
        };
        let (_output, trace) = executor
            .execute_step("s1", "find recent papers", 1, &step, &RunContext::new())
            .await;
        assert!(trace.final_success);
        assert_eq!(trace.attempts.len(), 2);
        assert!(!trace.attempts[0].success);
        assert!(trace.attempts[1].success);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_on_persistent_failure() {
        let mut registry = SubAgentRegistry::new();
        registry.register(Box::new(AlwaysErrorAgent));
        let executor = test_executor(registry, 2);
        let mut input_template = Map::new();
        input_template.insert("request".to_string(), Value::String("count rows".to_string()));
        let step = PlanStep {
            agent_name: "DatabaseQuery".to_string(),
            input_template,
        };
        let (_output, trace) = executor
            .execute_step("s1", "count the rows", 1, &step, &RunContext::new())
            .await;
        assert!(!trace.final_success);
        assert_eq!(trace.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_returns_single_failed_attempt() {
        let registry = SubAgentRegistry::new();
        let executor = test_executor(registry, 3);
        let step = PlanStep {
            agent_name: "NoSuchAgent".to_string(),
            input_template: Map::new(),
        };
        let (output, trace) = executor
            .execute_step("s1", "goal", 1, &step, &RunContext::new())
            .await;
        assert!(!trace.final_success);
        assert_eq!(trace.attempts.len(), 1);
        assert!(output.contains_key("error"));
    }

    #[test]
    fn test_has_required_fields_retrieval_qa() {
        let mut payload = Map::new();
        assert!(!has_required_fields("RetrievalQA", &payload));
        payload.insert("query".to_string(), Value::String("x".to_string()));
        assert!(has_required_fields("RetrievalQA", &payload));
    }

    #[test]
    fn test_adjudicate_websearch_requires_scholarly_minimum() {
        let mut scholarly = Map::new();
        scholarly.insert(
            "entries".to_string(),
            Value::Array((0..3).map(|_| Value::Object(Map::new())).collect()),
        );
        let mut output = Map::new();
        output.insert("scholarly".to_string(), Value::Object(scholarly));
        assert!(!adjudicate("WebSearch", &output, 5));
        assert!(adjudicate("WebSearch", &output, 3));
    }

    #[test]
    fn test_adjudicate_shell_tool_accepts_nonzero_exit_with_output() {
        let mut output = Map::new();
        output.insert("exit_code".to_string(), Value::from(1));
        output.insert("output".to_string(), Value::String("match found".to_string()));
        assert!(adjudicate("ShellTool", &output, 5));
    }

    #[test]
    fn test_adjudicate_unknown_agent_defaults_success() {
        assert!(adjudicate("SomeNewAgent", &Map::new(), 5));
    }
}
