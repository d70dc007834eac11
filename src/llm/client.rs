//! Provider registry and factory (C2).
//!
//! Maps provider names to concrete [`LlmProvider`] implementations.

use crate::config::OrchestratorConfig;
use crate::error::RunnerError;

use super::openai::OpenAiProvider;
use super::provider::LlmProvider;

/// Creates an [`LlmProvider`] based on the configured provider name.
///
/// # Supported Providers
///
/// - `"openai"` (default) — OpenAI-compatible APIs via `async-openai`
///
/// # Errors
///
/// Returns [`RunnerError::UnsupportedProvider`] for unknown provider names.
pub fn create_provider(config: &OrchestratorConfig) -> Result<Box<dyn LlmProvider>, RunnerError> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(
            &config.api_key,
            config.base_url.as_deref(),
        ))),
        other => Err(RunnerError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_openai_provider() {
        let config = OrchestratorConfig::builder()
            .api_key("test")
            .provider("openai")
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        let provider = create_provider(&config).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn test_create_unknown_provider_is_error() {
        let config = OrchestratorConfig::builder()
            .api_key("test")
            .provider("unknown")
            .build()
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(create_provider(&config).is_err());
    }
}
