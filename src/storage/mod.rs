//! Memory store (C3): SQLite-backed persistence for procedural workflows and
//! lessons, plus schema lifecycle.
//!
//! `rusqlite::Connection` is `!Send`; every method here runs synchronously on
//! the calling thread, matching the existing crate's storage access pattern
//! (storage-touching code never crosses an `await` boundary while holding the
//! connection). There is no native vector index — `top_k_similar` queries
//! fetch all rows and rank by in-application cosine similarity, a deliberate
//! simplification recorded in `DESIGN.md`.

mod lesson;
mod procedural;

pub use lesson::LessonMatch;
pub use procedural::ProceduralMatch;

use std::path::Path;

use rusqlite::Connection;

use crate::error::StorageError;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS procedural_memory (
    workflow_id         TEXT PRIMARY KEY,
    trigger_embedding   BLOB NOT NULL,
    trigger_pattern     TEXT,
    successful_workflow TEXT NOT NULL,
    result_keys         TEXT NOT NULL,
    usage_count         INTEGER NOT NULL DEFAULT 1,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lesson_memory (
    lesson_id         TEXT PRIMARY KEY,
    trigger_embedding BLOB NOT NULL,
    goal_text         TEXT NOT NULL,
    agent_name        TEXT NOT NULL,
    status            TEXT NOT NULL CHECK (status IN ('success', 'fail')),
    error_snippet     TEXT,
    fix_summary       TEXT,
    working_params    TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lesson_agent ON lesson_memory(agent_name);

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Aggregate counts over the memory store, for the `store status` command.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StorageStats {
    /// Number of persisted procedural workflows.
    pub workflow_count: u64,
    /// Number of persisted lessons.
    pub lesson_count: u64,
}

/// SQLite-backed implementation of the memory store contract.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (creating if absent) a database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(Self { conn })
    }

    /// Opens a private in-memory database, used in tests and ephemeral runs.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Creates the schema if it does not already exist.
    pub fn init(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(SCHEMA)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_meta(key, value) VALUES ('initialized', '1')",
            [],
        )?;
        Ok(())
    }

    /// Whether `init` has already been run against this database.
    pub fn is_initialized(&self) -> Result<bool, StorageError> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_meta')",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);
        Ok(exists)
    }

    /// Drops all data, leaving the schema in place.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "DELETE FROM procedural_memory; DELETE FROM lesson_memory;",
        )?;
        Ok(())
    }

    /// Returns aggregate counts of persisted workflows and lessons.
    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let workflow_count: u64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM procedural_memory", [], |r| r.get(0))?;
        let lesson_count: u64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM lesson_memory", [], |r| r.get(0))?;
        Ok(StorageStats {
            workflow_count,
            lesson_count,
        })
    }

    /// Runs an arbitrary, caller-validated read-only `SELECT` against this
    /// database and returns `(headers, rows)`, each cell rendered as a JSON
    /// value. Used by the DatabaseQuery sub-agent (C5); callers are
    /// responsible for rejecting non-`SELECT` statements before calling this.
    pub fn execute_readonly_query(
        &self,
        sql: &str,
    ) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>), StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let headers: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let column_count = headers.len();
        let rows = stmt.query_map([], |row| {
            (0..column_count)
                .map(|i| sqlite_value_to_json(row, i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok((headers, out))
    }
}

fn sqlite_value_to_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    use rusqlite::types::ValueRef;
    let value = match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
    };
    Ok(value)
}

/// Encodes an embedding vector as a little-endian `f32` blob.
fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes a little-endian `f32` blob back into a vector.
fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) fn setup_storage() -> SqliteStorage {
        let mut storage =
            SqliteStorage::in_memory().unwrap_or_else(|e| panic!("in_memory failed: {e}"));
        storage.init().unwrap_or_else(|e| panic!("init failed: {e}"));
        storage
    }

    #[test]
    fn test_init_marks_initialized() {
        let storage = setup_storage();
        assert!(storage.is_initialized().unwrap_or_else(|e| panic!("{e}")));
    }

    #[test]
    fn test_uninitialized_store_reports_false() {
        let storage =
            SqliteStorage::in_memory().unwrap_or_else(|e| panic!("in_memory failed: {e}"));
        assert!(!storage.is_initialized().unwrap_or_else(|e| panic!("{e}")));
    }

    #[test]
    fn test_stats_start_at_zero() {
        let storage = setup_storage();
        let stats = storage.stats().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(stats.workflow_count, 0);
        assert_eq!(stats.lesson_count, 0);
    }

    #[test]
    fn test_embedding_encode_decode_round_trip() {
        let vec = vec![0.1_f32, -0.2, 3.5, 0.0];
        let bytes = encode_embedding(&vec);
        let back = decode_embedding(&bytes);
        assert_eq!(back.len(), vec.len());
        for (a, b) in vec.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reset_clears_tables() {
        let mut storage = setup_storage();
        storage
            .procedural_upsert(
                "wf-1",
                &[1.0, 0.0],
                &[],
                &["step_1_RetrievalQA".to_string()],
                None,
            )
            .unwrap_or_else(|e| panic!("{e}"));
        storage.reset().unwrap_or_else(|e| panic!("{e}"));
        let stats = storage.stats().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(stats.workflow_count, 0);
    }
}
