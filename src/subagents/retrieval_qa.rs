//! RetrievalQA sub-agent: delegates to the RAG collaborator (C4).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::RunnerError;
use crate::llm::{system_message, user_message, ChatRequest, LlmProvider};

use super::{error_map, SubAgent};

/// Abstract RAG collaborator contract (C4): answer a query for a session,
/// presumably by retrieving over stored chunks/facts and conversation
/// history. The ingest, chunk-retrieval, and history-truncation machinery
/// behind this trait is an external collaborator concern and out of scope
/// here; this crate ships one direct-to-model implementation.
#[async_trait]
pub trait RagCollaborator: Send + Sync {
    /// Answers `query` for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error description on failure; callers surface it as
    /// `{"error": ...}` rather than propagating an exception.
    async fn chat(&self, session_id: &str, query: &str) -> Result<String, String>;
}

/// Minimal [`RagCollaborator`] that answers directly from the generative
/// model with no retrieval corpus, standing in for the full RAG chat path
/// (ingest + history truncation + prompt assembly) that this crate treats
/// as an external collaborator.
pub struct LlmRagCollaborator {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmRagCollaborator {
    /// Creates a collaborator backed by `provider`, using `model` for completions.
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl RagCollaborator for LlmRagCollaborator {
    async fn chat(&self, session_id: &str, query: &str) -> Result<String, String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                system_message(
                    "You are a retrieval-augmented assistant. Answer the user's question \
                     concisely and factually, noting uncertainty where present.",
                ),
                user_message(&format!("session: {session_id}\nquestion: {query}")),
            ],
            temperature: Some(0.2),
            max_tokens: Some(1024),
            json_mode: false,
        };
        self.provider
            .chat(&request)
            .await
            .map(|response| response.content)
            .map_err(|e: RunnerError| e.to_string())
    }
}

/// `RetrievalQA`: answers `payload.query` (or its `question` alias) via C4.
pub struct RetrievalQaAgent {
    collaborator: Arc<dyn RagCollaborator>,
}

impl RetrievalQaAgent {
    /// Creates the agent over a concrete RAG collaborator.
    #[must_use]
    pub fn new(collaborator: Arc<dyn RagCollaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl SubAgent for RetrievalQaAgent {
    fn name(&self) -> &'static str {
        "RetrievalQA"
    }

    async fn execute(&self, session_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
        let query = payload
            .get("query")
            .or_else(|| payload.get("question"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if query.is_empty() {
            return error_map("RetrievalQA requires query");
        }
        match self.collaborator.chat(session_id, query).await {
            Ok(answer) => {
                let mut map = Map::new();
                map.insert("answer".to_string(), Value::String(answer));
                map
            }
            Err(message) => error_map(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubCollaborator {
        answer: Result<String, String>,
    }

    #[async_trait]
    impl RagCollaborator for StubCollaborator {
        async fn chat(&self, _session_id: &str, _query: &str) -> Result<String, String> {
            self.answer.clone()
        }
    }

    #[tokio::test]
    async fn test_missing_query_is_error() {
        let agent = RetrievalQaAgent::new(Arc::new(StubCollaborator {
            answer: Ok("unused".to_string()),
        }));
        let out = agent.execute("s1", &Map::new()).await;
        assert!(out.contains_key("error"));
    }

    #[tokio::test]
    async fn test_question_alias_accepted() {
        let agent = RetrievalQaAgent::new(Arc::new(StubCollaborator {
            answer: Ok("42".to_string()),
        }));
        let mut payload = Map::new();
        payload.insert("question".to_string(), Value::String("what is it".to_string()));
        let out = agent.execute("s1", &payload).await;
        assert_eq!(out.get("answer"), Some(&Value::String("42".to_string())));
    }

    #[tokio::test]
    async fn test_collaborator_failure_becomes_error_map() {
        let agent = RetrievalQaAgent::new(Arc::new(StubCollaborator {
            answer: Err("unreachable".to_string()),
        }));
        let mut payload = Map::new();
        payload.insert("query".to_string(), Value::String("q".to_string()));
        let out = agent.execute("s1", &payload).await;
        assert_eq!(out.get("error"), Some(&Value::String("unreachable".to_string())));
    }
}
