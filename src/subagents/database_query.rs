//! DatabaseQuery sub-agent: NL→SQL via C2 under a strict SELECT-only
//! constraint, executed against the memory store (C3).

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RunnerError;
use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};
use crate::storage::SqliteStorage;

use super::{error_map, SubAgent};

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

/// Whether `sql` is a read-only `SELECT` after trimming, case-insensitively.
/// Purely lexical: no SQL parser dependency, matching the contract's "starts
/// with select" check rather than a full grammar.
#[must_use]
pub fn is_select_only(sql: &str) -> bool {
    sql.trim().to_ascii_lowercase().starts_with("select")
}

/// `DatabaseQuery`: translates `payload.request` to SQL and runs it
/// read-only against the memory store.
pub struct DatabaseQueryAgent {
    provider: Arc<dyn LlmProvider>,
    model: String,
    storage: Arc<Mutex<SqliteStorage>>,
}

impl DatabaseQueryAgent {
    /// Creates the agent over a generative model and the shared memory store.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, storage: Arc<Mutex<SqliteStorage>>) -> Self {
        Self {
            provider,
            model: model.into(),
            storage,
        }
    }

    async fn nl_to_sql(&self, request: &str, schema_hint: &str) -> Result<String, RunnerError> {
        let system = format!(
            "You translate natural language to SQLite SQL.\n\
             Constraints: SELECT-only, safe, no writes. Return strict JSON {{\"sql\": \"<SQL>\"}}.\n\
             Schema hint: {schema_hint}"
        );
        let request_msg = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                system_message(&system),
                user_message(&format!("NL: {request}")),
            ],
            temperature: Some(0.0),
            max_tokens: Some(512),
            json_mode: true,
        };
        let response = self.provider.chat(&request_msg).await?;
        let cleaned = strip_fences(&response.content);
        let parsed: Value = serde_json::from_str(cleaned).map_err(|e| RunnerError::MalformedModelOutput {
            message: e.to_string(),
            raw: cleaned.to_string(),
        })?;
        let sql = parsed
            .get("sql")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(sql)
    }
}

#[async_trait]
impl SubAgent for DatabaseQueryAgent {
    fn name(&self) -> &'static str {
        "DatabaseQuery"
    }

    async fn execute(&self, _session_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
        let request = payload
            .get("request")
            .or_else(|| payload.get("query"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if request.is_empty() {
            return error_map("DatabaseQuery requires request");
        }
        let schema_hint = payload
            .get("schema_hint")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let sql = match self.nl_to_sql(request, schema_hint).await {
            Ok(sql) => sql,
            Err(e) => return error_map(e.to_string()),
        };

        if sql.is_empty() || !is_select_only(&sql) {
            let mut map = error_map("generated SQL invalid: not a read-only SELECT");
            map.insert("sql".to_string(), Value::String(sql));
            return map;
        }

        let query_result = {
            let storage = match self.storage.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            storage.execute_readonly_query(&sql)
        };

        match query_result {
            Ok((headers, rows)) => {
                let mut map = Map::new();
                map.insert("sql".to_string(), Value::String(sql));
                map.insert(
                    "headers".to_string(),
                    Value::Array(headers.into_iter().map(Value::String).collect()),
                );
                map.insert(
                    "rows".to_string(),
                    Value::Array(rows.into_iter().map(|row| Value::Array(row)).collect()),
                );
                map
            }
            Err(e) => {
                let mut map = error_map(e.to_string());
                map.insert("sql".to_string(), Value::String(sql));
                map
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_select_only_accepts_select() {
        assert!(is_select_only("  SELECT * FROM lesson_memory"));
        assert!(is_select_only("select workflow_id from procedural_memory"));
    }

    #[test]
    fn test_is_select_only_rejects_writes() {
        assert!(!is_select_only("DROP TABLE lesson_memory"));
        assert!(!is_select_only("DELETE FROM procedural_memory"));
        assert!(!is_select_only(""));
    }

    #[test]
    fn test_strip_fences_removes_markdown() {
        let raw = "```json\n{\"sql\": \"select 1\"}\n```";
        assert_eq!(strip_fences(raw), "{\"sql\": \"select 1\"}");
    }

    #[test]
    fn test_strip_fences_passthrough_when_no_fence() {
        assert_eq!(strip_fences("{\"sql\": \"select 1\"}"), "{\"sql\": \"select 1\"}");
    }
}
