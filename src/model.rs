//! Core data model: plans, step traces, run context, and the two durable
//! memory-tier records (procedural workflows and lessons).
//!
//! Payloads and outputs are represented as `serde_json::Map<String, Value>`
//! rather than bespoke per-agent structs, so that fields unknown to this
//! crate survive a round trip through the model unmolested.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A free-text goal paired with its session identifier. Immutable within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    /// Caller-supplied session identifier; also used to name the run directory.
    pub session_id: String,
    /// The natural-language goal text.
    pub text: String,
}

/// One step of a plan: which sub-agent to invoke and its starting payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Name of a sub-agent in the registry (see `crate::subagents`).
    pub agent_name: String,
    /// Initial parameter mapping; may be empty and completed by the proposer.
    #[serde(default)]
    pub input_template: Map<String, Value>,
}

/// An ordered sequence of steps, length 1..N (typically 3-6 in practice).
pub type Plan = Vec<PlanStep>;

/// One attempt at executing a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// 1-based attempt index within the step.
    pub attempt_index: usize,
    /// The realized input mapping, excluding the transient `context` field.
    pub input: Map<String, Value>,
    /// Whether this attempt was adjudicated successful.
    pub success: bool,
    /// Wall-clock seconds this attempt took.
    pub elapsed_seconds: f64,
    /// A preview of the sub-agent's output, truncated to ~4 KiB.
    pub output_preview: String,
}

/// Maximum length of a [`StepAttempt::output_preview`] before truncation.
pub const MAX_OUTPUT_PREVIEW_BYTES: usize = 4096;

/// Truncates `text` to at most `MAX_OUTPUT_PREVIEW_BYTES` bytes, appending an
/// ellipsis marker when truncation occurred. Truncates on a char boundary.
#[must_use]
pub fn truncate_preview(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_PREVIEW_BYTES {
        return text.to_string();
    }
    let mut end = MAX_OUTPUT_PREVIEW_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated]", &text[..end])
}

/// The persisted record of one step's execution: every attempt plus whether
/// the step ultimately succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    /// Name of the sub-agent this step invoked.
    pub agent_name: String,
    /// Every attempt made for this step, in order.
    pub attempts: Vec<StepAttempt>,
    /// Whether the last attempt (or any attempt) succeeded.
    pub final_success: bool,
}

/// Ordered accumulation of per-step outputs, keyed `step_<i>_<agent_name>`.
///
/// Keys are inserted in strictly increasing step-index order and never
/// overwritten; `BTreeMap` alone would not preserve insertion order for
/// non-numeric-prefixed keys, so this wraps a `Vec` of entries plus a key
/// index for O(1) lookup while serializing as an ordered JSON object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunContext {
    entries: Vec<(String, Value)>,
}

impl RunContext {
    /// Creates an empty run context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step's output under `step_<index>_<agent_name>`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `index` is not the next expected index,
    /// enforcing the "strictly ordered, no overwrite" invariant at the call
    /// site rather than silently reordering.
    pub fn push_step(&mut self, index: usize, agent_name: &str, output: Value) {
        debug_assert_eq!(
            index,
            self.entries.len() + 1,
            "RunContext steps must be appended in strictly increasing order"
        );
        let key = format!("step_{index}_{agent_name}");
        self.entries.push((key, output));
    }

    /// Returns the ordered list of keys written so far.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Returns the last `n` keys, or all keys if fewer than `n` exist.
    #[must_use]
    pub fn last_keys(&self, n: usize) -> Vec<String> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].iter().map(|(k, _)| k.clone()).collect()
    }

    /// Number of steps recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no steps have been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders as a `BTreeMap` snapshot for read-only inspection by sub-agents
    /// (the reserved `context` payload field).
    #[must_use]
    pub fn as_view(&self) -> BTreeMap<String, Value> {
        self.entries.iter().cloned().collect()
    }

    /// Renders the full context as a pretty-printed JSON object, used for
    /// `context.json` and as the basis of `report.txt`.
    #[must_use]
    pub fn to_pretty_json(&self) -> String {
        let map: Map<String, Value> = self.entries.iter().cloned().collect();
        serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A durable, embedding-indexed successful plan, used to skip planning on
/// semantically similar future goals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduralWorkflow {
    /// Unique identifier, stable across upserts.
    pub workflow_id: String,
    /// Embedding of the triggering goal text; dimension is fixed per deployment.
    pub trigger_embedding: Vec<f32>,
    /// Optional human-readable description of the trigger, for inspection tooling.
    pub trigger_pattern: Option<String>,
    /// The exact plan that was executed.
    pub plan: Plan,
    /// Ordered top-level `RunContext` keys from the run that produced this workflow.
    pub result_keys: Vec<String>,
    /// Number of times this workflow has been tried (reused or freshly learned).
    pub usage_count: u64,
}

/// Outcome of a lesson: whether the (goal, agent) pairing succeeded or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonStatus {
    /// The step succeeded with the recorded `working_params`.
    Success,
    /// The step failed; `fix_summary`/`error_snippet` describe the failure.
    Fail,
}

/// An append-only, semantically-keyed fragment pairing a (goal, agent) with
/// either a known-good parameter set or a failure pattern and suggested fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    /// Unique identifier.
    pub lesson_id: String,
    /// Embedding of the triggering goal text.
    pub trigger_embedding: Vec<f32>,
    /// The goal text this lesson was learned from.
    pub goal_text: String,
    /// Sub-agent this lesson concerns.
    pub agent_name: String,
    /// Whether this is a success or failure lesson.
    pub status: LessonStatus,
    /// Truncated evidence of the failure, when `status == Fail`.
    pub error_snippet: Option<String>,
    /// Suggested remediation, when `status == Fail`.
    pub fix_summary: Option<String>,
    /// The parameter mapping that worked (or was attempted), when known.
    pub working_params: Option<Map<String, Value>>,
}
