//! Learner (C9): persists a fresh procedural workflow after a non-reused run
//! and derives reflective lessons from the executed step traces.
//!
//! Both `learn` and `reflect` are best-effort (§4.7, §4.8): any embedding or
//! storage failure is swallowed rather than propagated, so a faulting
//! learner/reflection phase never changes the run's returned result.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::embedding::Embedder;
use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};
use crate::model::{Lesson, LessonStatus, Plan, StepTrace};
use crate::storage::SqliteStorage;

const REFLECTION_SYSTEM_PROMPT: &str = "You analyze step execution traces from a multi-agent \
task run and extract lessons for future runs. Return strict JSON only, no prose, no markdown \
fences: {\"fail_patterns\": [{\"agent\": string, \"pattern\": string, \"recommended_fix\": \
string, \"example_input\": object}], \"success_snippets\": [{\"agent\": string, \
\"working_params\": object}]}. Use empty arrays where nothing applies.";

/// Maximum length of a reflection fail-pattern's persisted `error_snippet`.
const FAIL_PATTERN_SNIPPET_MAX: usize = 500;

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

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

/// Learner/reflector (C9), holding the shared generative model, embedder, and
/// memory store used to persist workflows and lessons.
pub struct Learner {
    provider: Arc<dyn LlmProvider>,
    model: String,
    embedder: Arc<dyn Embedder>,
    storage: Arc<Mutex<SqliteStorage>>,
}

impl std::fmt::Debug for Learner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Learner").field("model", &self.model).finish_non_exhaustive()
    }
}

impl Learner {
    /// Creates a learner over the shared generative model, embedder, and store.
    #[must_use]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        storage: Arc<Mutex<SqliteStorage>>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            embedder,
            storage,
        }
    }

    /// Persists the executed `plan` as a fresh procedural workflow keyed by
    /// `goal`'s embedding. Returns the new workflow id, or `None` if the
    /// embedding or the write failed (both soft failures).
    #[must_use]
    pub fn learn(&self, goal: &str, plan: &Plan, result_keys: &[String]) -> Option<String> {
        let embedding = self.embedder.embed(goal)?;
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let result = {
            let mut storage = match self.storage.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            storage.procedural_upsert(&workflow_id, &embedding, plan, result_keys, None)
        };
        match result {
            Ok(()) => Some(workflow_id),
            Err(error) => {
                debug!(%error, "learner: failed to persist procedural workflow");
                None
            }
        }
    }

    /// Bumps `usage_count` for a reused workflow after the run completes
    /// (regardless of whether the run itself succeeded). Soft failure.
    pub fn bump_usage(&self, workflow_id: &str) {
        let result = {
            let mut storage = match self.storage.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            storage.procedural_bump_usage(workflow_id)
        };
        if let Err(error) = result {
            debug!(%error, workflow_id, "learner: failed to bump usage_count");
        }
    }

    /// Composes evidence from the last 1-2 attempts of each step, asks C2 for
    /// fail patterns and success snippets, persists each as a `Lesson`, and
    /// returns the parsed reflection (for `reflection.json`). Returns `None`
    /// on any failure: malformed C2 output, transport error, or empty traces.
    pub async fn reflect(&self, goal: &str, traces: &[StepTrace]) -> Option<Value> {
        if traces.is_empty() {
            return None;
        }

        let evidence: Vec<Value> = traces
            .iter()
            .map(|trace| {
                let start = trace.attempts.len().saturating_sub(2);
                let recent: Vec<Value> = trace.attempts[start..]
                    .iter()
                    .map(|attempt| {
                        serde_json::json!({
                            "attempt_index": attempt.attempt_index,
                            "input": attempt.input,
                            "success": attempt.success,
                            "output_preview": attempt.output_preview,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "agent": trace.agent_name,
                    "final_success": trace.final_success,
                    "recent_attempts": recent,
                })
            })
            .collect();

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                system_message(REFLECTION_SYSTEM_PROMPT),
                user_message(&format!(
                    "Goal: {goal}\n\nStep evidence:\n{}",
                    serde_json::to_string_pretty(&evidence).unwrap_or_default()
                )),
            ],
            temperature: Some(0.2),
            max_tokens: Some(1024),
            json_mode: true,
        };

        let response = match self.provider.chat(&request).await {
            Ok(response) => response,
            Err(error) => {
                debug!(%error, "reflection: C2 call failed, skipping");
                return None;
            }
        };

        let cleaned = strip_fences(&response.content);
        let parsed: Value = match serde_json::from_str(cleaned) {
            Ok(value) => value,
            Err(error) => {
                debug!(%error, "reflection: malformed JSON output, skipping");
                return None;
            }
        };

        let goal_embedding = self.embedder.embed(goal).unwrap_or_default();
        if !goal_embedding.is_empty() {
            self.persist_reflection_lessons(goal, &goal_embedding, &parsed);
        }

        Some(parsed)
    }

    fn persist_reflection_lessons(&self, goal: &str, goal_embedding: &[f32], parsed: &Value) {
        for fail_pattern in parsed.get("fail_patterns").and_then(Value::as_array).into_iter().flatten() {
            let Some(agent) = fail_pattern.get("agent").and_then(Value::as_str) else {
                continue;
            };
            let pattern = fail_pattern.get("pattern").and_then(Value::as_str).unwrap_or_default();
            let lesson = Lesson {
                lesson_id: uuid::Uuid::new_v4().to_string(),
                trigger_embedding: goal_embedding.to_vec(),
                goal_text: goal.to_string(),
                agent_name: agent.to_string(),
                status: LessonStatus::Fail,
                error_snippet: Some(truncate_chars(pattern, FAIL_PATTERN_SNIPPET_MAX)),
                fix_summary: fail_pattern
                    .get("recommended_fix")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                working_params: fail_pattern.get("example_input").and_then(Value::as_object).cloned(),
            };
            self.persist_one(lesson);
        }

        for snippet in parsed.get("success_snippets").and_then(Value::as_array).into_iter().flatten() {
            let Some(agent) = snippet.get("agent").and_then(Value::as_str) else {
                continue;
            };
            let Some(working_params) = snippet.get("working_params").and_then(Value::as_object).cloned() else {
                continue;
            };
            let lesson = Lesson {
                lesson_id: uuid::Uuid::new_v4().to_string(),
                trigger_embedding: goal_embedding.to_vec(),
                goal_text: goal.to_string(),
                agent_name: agent.to_string(),
                status: LessonStatus::Success,
                error_snippet: None,
                fix_summary: None,
                working_params: Some(working_params),
            };
            self.persist_one(lesson);
        }
    }

    fn persist_one(&self, lesson: Lesson) {
        let result = {
            let mut storage = match self.storage.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            storage.lesson_insert(&lesson)
        };
        if let Err(error) = result {
            debug!(%error, agent = %lesson.agent_name, "reflection: lesson insert failed, continuing");
        }
    }
}
