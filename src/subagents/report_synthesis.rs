//! ReportSynthesis sub-agent: composes a short brief from upstream step
//! output via C2, falling back to a deterministic local flatten when the
//! model call fails.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};

use super::SubAgent;

static NULL_VALUE: Value = Value::Null;

fn source_payload(payload: &Map<String, Value>) -> &Value {
    payload
        .get("points")
        .or_else(|| payload.get("data"))
        .or_else(|| payload.get("payload"))
        .unwrap_or(&NULL_VALUE)
}

/// Renders an arbitrary JSON value as nested bullet points, the local
/// fallback used when the generative model is unavailable.
fn flatten_to_bullets(value: &Value, depth: usize) -> String {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::Object(_) | Value::Array(_) => {
                    format!("{indent}- {k}:\n{}", flatten_to_bullets(v, depth + 1))
                }
                _ => format!("{indent}- {k}: {}", render_scalar(v)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Array(items) => items
            .iter()
            .map(|v| format!("{indent}- {}", render_scalar(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => format!("{indent}- {}", render_scalar(other)),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(none)".to_string(),
        other => other.to_string(),
    }
}

/// `ReportSynthesis`: produces a `report` string from `payload.points` (or
/// `.data`/`.payload`), preferring an LLM-composed brief over the raw flatten.
pub struct ReportSynthesisAgent {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ReportSynthesisAgent {
    /// Creates the agent over a generative model used for brief composition.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl SubAgent for ReportSynthesisAgent {
    fn name(&self) -> &'static str {
        "ReportSynthesis"
    }

    async fn execute(&self, _session_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
        let source = source_payload(payload);
        let fallback = flatten_to_bullets(source, 0);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                system_message(
                    "You write short, factual briefs from structured findings. \
                     Produce plain text, a few sentences to a short paragraph, no markdown headers.",
                ),
                user_message(&format!(
                    "Compose a brief report from this data:\n{}",
                    serde_json::to_string_pretty(source).unwrap_or_else(|_| fallback.clone())
                )),
            ],
            temperature: Some(0.3),
            max_tokens: Some(768),
            json_mode: false,
        };

        let mut map = Map::new();
        match self.provider.chat(&request).await {
            Ok(response) if !response.content.trim().is_empty() => {
                map.insert("report".to_string(), Value::String(response.content));
            }
            _ => {
                map.insert("report".to_string(), Value::String(fallback));
                map.insert(
                    "note".to_string(),
                    Value::String("generative model unavailable; used local summary".to_string()),
                );
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_to_bullets_nested_object() {
        let value = serde_json::json!({"title": "t", "context": ["a", "b"]});
        let rendered = flatten_to_bullets(&value, 0);
        assert!(rendered.contains("title: t"));
        assert!(rendered.contains("- a"));
    }

    #[test]
    fn test_flatten_to_bullets_scalar() {
        let value = Value::String("hello".to_string());
        assert_eq!(flatten_to_bullets(&value, 0), "- hello");
    }

    #[test]
    fn test_source_payload_prefers_points() {
        let mut payload = Map::new();
        payload.insert("points".to_string(), serde_json::json!({"a": 1}));
        payload.insert("data".to_string(), serde_json::json!({"b": 2}));
        assert_eq!(source_payload(&payload), &serde_json::json!({"a": 1}));
    }
}
