//! Error types for the task runner.
//!
//! Mirrors the layering of a CLI-plus-library crate: a typed `RunnerError` for
//! the planner/executor/learner core, a typed `StorageError` for the memory
//! store, and a `CommandError` wrapper at the CLI boundary. All three compose
//! behind the crate-level [`Result`] alias.

use thiserror::Error;

/// Crate-level result alias used throughout the runner.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors raised by the planner/executor/learner/orchestrator core.
///
/// Variant names track the semantic error kinds in the specification rather
/// than implementation details, so callers can match on "what went wrong"
/// independent of which component raised it.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// C2 returned output that could not be parsed as the expected strict JSON shape.
    #[error("malformed model output: {message}")]
    MalformedModelOutput {
        /// Human-readable description of what was expected.
        message: String,
        /// The raw (possibly truncated) text that failed to parse.
        raw: String,
    },

    /// A plan or reuse candidate referenced a sub-agent name outside the registry.
    #[error("unknown sub-agent: {name}")]
    UnknownAgent {
        /// The offending agent name.
        name: String,
    },

    /// The configured LLM provider name has no registered implementation.
    #[error("unsupported LLM provider: {name}")]
    UnsupportedProvider {
        /// The offending provider name.
        name: String,
    },

    /// The generative model (C2) returned an API or transport failure.
    #[error("LLM request failed: {message}")]
    LlmRequest {
        /// Description of the failure, usually the underlying SDK error text.
        message: String,
    },

    /// DatabaseQuery's proposed SQL was not a read-only SELECT.
    #[error("unsafe SQL rejected: {sql}")]
    UnsafeSql {
        /// The SQL text that was rejected.
        sql: String,
    },

    /// The memory store could not be reached or query failed; callers treat
    /// this as a soft failure for reuse/learning/lesson retrieval.
    #[error("memory store unavailable: {0}")]
    MemoryStoreUnavailable(#[from] StorageError),

    /// The overall task deadline or a per-call sub-agent deadline elapsed.
    #[error("deadline exceeded after {elapsed_secs:.1}s")]
    DeadlineExceeded {
        /// Wall-clock seconds elapsed before the deadline fired.
        elapsed_secs: f64,
    },

    /// A structural invariant was violated (e.g. embedding dimension mismatch).
    /// Always fatal: the run aborts with a non-zero exit code.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Wraps an I/O failure writing run-directory artifacts.
    #[error("artifact write failed: {0}")]
    ArtifactWrite(#[from] std::io::Error),

    /// Wraps a JSON (de)serialization failure outside the lenient-parse paths,
    /// where the core considers the shape a hard requirement.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the SQLite-backed memory store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying SQLite driver returned an error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store was queried before `init()` created its schema.
    #[error("storage not initialized; run `task-runner init` first")]
    NotInitialized,

    /// A row's JSON column could not be decoded into the expected type.
    #[error("corrupt row in {table}: {message}")]
    CorruptRow {
        /// Table the row was read from.
        table: &'static str,
        /// Decoding failure description.
        message: String,
    },
}

/// Errors surfaced at the CLI command boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    /// A runner operation failed; wraps the underlying error for display.
    #[error("{0}")]
    Runner(#[from] RunnerError),

    /// A storage operation failed directly (e.g. during `init`/`reset`).
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// The command itself could not complete (bad arguments, filesystem issues
    /// unrelated to the run directory contract, etc.).
    #[error("{0}")]
    ExecutionFailed(String),
}
