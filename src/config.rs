//! Runtime configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::RunnerError;

/// Default maximum planner retry attempts before falling back to the
/// deterministic default plan.
const DEFAULT_PLANNER_MAX_ATTEMPTS: u32 = 3;
/// Default procedural-memory candidates considered by the reuse gate.
const DEFAULT_PROCEDURAL_TOP_K: usize = 5;
/// Default cosine-similarity threshold a procedural candidate must clear to be reused.
const DEFAULT_PROCEDURAL_REUSE_THRESHOLD: f32 = 0.90;
/// Default base directory run artifacts are written under.
const DEFAULT_RUNS_BASE_DIR: &str = "runs";
/// Default per-sub-agent-call timeout in seconds.
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 60;
/// Default overall per-request deadline in seconds.
const DEFAULT_OVERALL_DEADLINE_SECS: u64 = 600;
/// Default minimum scholarly-source entry count for a WebSearch step to be
/// adjudicated successful (§4.4).
const DEFAULT_WEBSEARCH_SCHOLARLY_MIN: usize = 5;
/// Default planner model.
const DEFAULT_PLANNER_MODEL: &str = "gpt-5.2-2025-12-11";
/// Default proposer (parameter-completion) model.
const DEFAULT_PROPOSER_MODEL: &str = "gpt-5-mini-2025-08-07";
/// Default reflection model.
const DEFAULT_REFLECTION_MODEL: &str = "gpt-5.2-2025-12-11";

/// Configuration for the orchestrated task runner (C6-C10 and the memory store).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// LLM provider name (e.g., "openai").
    pub provider: String,
    /// API key for the provider.
    pub api_key: String,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Model used by the planner (C6).
    pub planner_model: String,
    /// Model used for parameter proposal and reflection completions.
    pub proposer_model: String,
    /// Model used by the learner's reflection step (C9).
    pub reflection_model: String,
    /// Whether the reuse gate (C8) is enabled at all.
    pub m3_enabled: bool,
    /// Number of procedural-memory candidates the reuse gate considers.
    pub procedural_top_k: usize,
    /// Minimum cosine similarity for a procedural candidate to be reused.
    pub procedural_reuse_threshold: f32,
    /// Maximum planner attempts before falling back to the default plan.
    pub planner_max_attempts: u32,
    /// Timeout applied to each individual sub-agent call.
    pub agent_timeout: Duration,
    /// Overall wall-clock deadline for one `handle_request` invocation.
    pub overall_deadline: Duration,
    /// Minimum scholarly-source entry count for a WebSearch step to be
    /// adjudicated successful (§4.4).
    pub websearch_scholarly_min: usize,
    /// Base directory run directories are created under.
    pub runs_base_dir: PathBuf,
    /// Path to the SQLite memory-store database file.
    pub db_path: PathBuf,
}

impl OrchestratorConfig {
    /// Creates a new builder for `OrchestratorConfig`.
    #[must_use]
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Builds configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvariantViolation`] if no API key is found.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::builder().from_env().build()
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    planner_model: Option<String>,
    proposer_model: Option<String>,
    reflection_model: Option<String>,
    m3_enabled: Option<bool>,
    procedural_top_k: Option<usize>,
    procedural_reuse_threshold: Option<f32>,
    planner_max_attempts: Option<u32>,
    agent_timeout: Option<Duration>,
    overall_deadline: Option<Duration>,
    websearch_scholarly_min: Option<usize>,
    runs_base_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
}

impl OrchestratorConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = std::env::var("LLM_PROVIDER").ok();
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok();
        }
        if self.base_url.is_none() {
            self.base_url = std::env::var("LLM_BASE_URL").ok();
        }
        if self.planner_model.is_none() {
            self.planner_model = std::env::var("PLANNER_MODEL").ok();
        }
        if self.proposer_model.is_none() {
            self.proposer_model = std::env::var("PROPOSER_MODEL").ok();
        }
        if self.reflection_model.is_none() {
            self.reflection_model = std::env::var("REFLECTION_MODEL").ok();
        }
        if self.m3_enabled.is_none() {
            self.m3_enabled = std::env::var("M3_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.procedural_top_k.is_none() {
            self.procedural_top_k = std::env::var("PROCEDURAL_TOP_K")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.procedural_reuse_threshold.is_none() {
            self.procedural_reuse_threshold = std::env::var("PROCEDURAL_REUSE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.planner_max_attempts.is_none() {
            self.planner_max_attempts = std::env::var("PLANNER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.agent_timeout.is_none() {
            self.agent_timeout = std::env::var("AGENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
        }
        if self.overall_deadline.is_none() {
            self.overall_deadline = std::env::var("OVERALL_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs);
        }
        if self.websearch_scholarly_min.is_none() {
            self.websearch_scholarly_min = std::env::var("WEBSEARCH_SCHOLARLY_MIN")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.runs_base_dir.is_none() {
            self.runs_base_dir = std::env::var("RUNS_BASE_DIR").ok().map(PathBuf::from);
        }
        if self.db_path.is_none() {
            self.db_path = std::env::var("TASK_RUNNER_DB_PATH").ok().map(PathBuf::from);
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the planner model.
    #[must_use]
    pub fn planner_model(mut self, model: impl Into<String>) -> Self {
        self.planner_model = Some(model.into());
        self
    }

    /// Sets the proposer model.
    #[must_use]
    pub fn proposer_model(mut self, model: impl Into<String>) -> Self {
        self.proposer_model = Some(model.into());
        self
    }

    /// Sets the reflection model.
    #[must_use]
    pub fn reflection_model(mut self, model: impl Into<String>) -> Self {
        self.reflection_model = Some(model.into());
        self
    }

    /// Enables or disables the reuse gate.
    #[must_use]
    pub const fn m3_enabled(mut self, enabled: bool) -> Self {
        self.m3_enabled = Some(enabled);
        self
    }

    /// Sets the procedural-memory top-K considered by the reuse gate.
    #[must_use]
    pub const fn procedural_top_k(mut self, n: usize) -> Self {
        self.procedural_top_k = Some(n);
        self
    }

    /// Sets the reuse gate's cosine-similarity threshold.
    #[must_use]
    pub const fn procedural_reuse_threshold(mut self, threshold: f32) -> Self {
        self.procedural_reuse_threshold = Some(threshold);
        self
    }

    /// Sets the planner's maximum retry attempts.
    #[must_use]
    pub const fn planner_max_attempts(mut self, n: u32) -> Self {
        self.planner_max_attempts = Some(n);
        self
    }

    /// Sets the per-sub-agent-call timeout.
    #[must_use]
    pub const fn agent_timeout(mut self, duration: Duration) -> Self {
        self.agent_timeout = Some(duration);
        self
    }

    /// Sets the overall per-request deadline.
    #[must_use]
    pub const fn overall_deadline(mut self, duration: Duration) -> Self {
        self.overall_deadline = Some(duration);
        self
    }

    /// Sets WebSearch's scholarly-source minimum entry count for success.
    #[must_use]
    pub const fn websearch_scholarly_min(mut self, min: usize) -> Self {
        self.websearch_scholarly_min = Some(min);
        self
    }

    /// Sets the base directory run directories are created under.
    #[must_use]
    pub fn runs_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_base_dir = Some(dir.into());
        self
    }

    /// Sets the SQLite memory-store database path.
    #[must_use]
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Builds the [`OrchestratorConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::InvariantViolation`] if no API key was set.
    pub fn build(self) -> Result<OrchestratorConfig, RunnerError> {
        let api_key = self.api_key.ok_or_else(|| {
            RunnerError::InvariantViolation(
                "no LLM API key set (LLM_API_KEY / OPENAI_API_KEY)".to_string(),
            )
        })?;

        Ok(OrchestratorConfig {
            provider: self.provider.unwrap_or_else(|| "openai".to_string()),
            api_key,
            base_url: self.base_url,
            planner_model: self
                .planner_model
                .unwrap_or_else(|| DEFAULT_PLANNER_MODEL.to_string()),
            proposer_model: self
                .proposer_model
                .unwrap_or_else(|| DEFAULT_PROPOSER_MODEL.to_string()),
            reflection_model: self
                .reflection_model
                .unwrap_or_else(|| DEFAULT_REFLECTION_MODEL.to_string()),
            m3_enabled: self.m3_enabled.unwrap_or(false),
            procedural_top_k: self.procedural_top_k.unwrap_or(DEFAULT_PROCEDURAL_TOP_K),
            procedural_reuse_threshold: self
                .procedural_reuse_threshold
                .unwrap_or(DEFAULT_PROCEDURAL_REUSE_THRESHOLD),
            planner_max_attempts: self
                .planner_max_attempts
                .unwrap_or(DEFAULT_PLANNER_MAX_ATTEMPTS),
            agent_timeout: self
                .agent_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS)),
            overall_deadline: self
                .overall_deadline
                .unwrap_or(Duration::from_secs(DEFAULT_OVERALL_DEADLINE_SECS)),
            websearch_scholarly_min: self
                .websearch_scholarly_min
                .unwrap_or(DEFAULT_WEBSEARCH_SCHOLARLY_MIN),
            runs_base_dir: self
                .runs_base_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNS_BASE_DIR)),
            db_path: self.db_path.unwrap_or_else(|| PathBuf::from("task_runner.db")),
        })
    }
}

/// Returns the current time as an RFC 3339 string, used for every persisted
/// timestamp column and run-directory name.
#[must_use]
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
