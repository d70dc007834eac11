//! Procedural memory queries (C3): the reuse gate's read path and the
//! learner's write path over `procedural_memory`.

use rusqlite::params;

use crate::embedding::cosine_similarity;
use crate::error::StorageError;
use crate::model::{Plan, PlanStep, ProceduralWorkflow};

use super::{decode_embedding, encode_embedding, SqliteStorage};

/// A procedural workflow ranked against a query embedding.
#[derive(Debug, Clone)]
pub struct ProceduralMatch {
    /// The stored workflow.
    pub workflow: ProceduralWorkflow,
    /// Cosine similarity against the query embedding, in `[-1.0, 1.0]`.
    pub similarity: f32,
}

fn row_to_workflow(
    workflow_id: String,
    embedding_blob: Vec<u8>,
    trigger_pattern: Option<String>,
    successful_workflow: String,
    result_keys_json: String,
    usage_count: u64,
) -> Result<ProceduralWorkflow, StorageError> {
    let plan: Plan =
        serde_json::from_str(&successful_workflow).map_err(|e| StorageError::CorruptRow {
            table: "procedural_memory",
            message: format!("successful_workflow column: {e}"),
        })?;
    let result_keys: Vec<String> =
        serde_json::from_str(&result_keys_json).map_err(|e| StorageError::CorruptRow {
            table: "procedural_memory",
            message: format!("result_keys column: {e}"),
        })?;
    Ok(ProceduralWorkflow {
        workflow_id,
        trigger_embedding: decode_embedding(&embedding_blob),
        trigger_pattern,
        plan,
        result_keys,
        usage_count,
    })
}

impl SqliteStorage {
    /// Inserts a new procedural workflow, or replaces an existing one with
    /// the same `workflow_id` while preserving its prior `usage_count`.
    pub fn procedural_upsert(
        &mut self,
        workflow_id: &str,
        trigger_embedding: &[f32],
        plan: &[PlanStep],
        result_keys: &[String],
        trigger_pattern: Option<&str>,
    ) -> Result<(), StorageError> {
        let blob = encode_embedding(trigger_embedding);
        let plan_json = serde_json::to_string(plan).map_err(|e| StorageError::CorruptRow {
            table: "procedural_memory",
            message: format!("encoding plan: {e}"),
        })?;
        let keys_json =
            serde_json::to_string(result_keys).map_err(|e| StorageError::CorruptRow {
                table: "procedural_memory",
                message: format!("encoding result_keys: {e}"),
            })?;
        let now = crate::config::now_rfc3339();
        self.conn.execute(
            "INSERT INTO procedural_memory
                (workflow_id, trigger_embedding, trigger_pattern, successful_workflow, result_keys, usage_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
             ON CONFLICT(workflow_id) DO UPDATE SET
                trigger_embedding = excluded.trigger_embedding,
                trigger_pattern = excluded.trigger_pattern,
                successful_workflow = excluded.successful_workflow,
                result_keys = excluded.result_keys,
                usage_count = procedural_memory.usage_count + 1,
                updated_at = excluded.updated_at",
            params![workflow_id, blob, trigger_pattern, plan_json, keys_json, now],
        )?;
        Ok(())
    }

    /// Increments `usage_count` for a workflow that was just reused.
    pub fn procedural_bump_usage(&mut self, workflow_id: &str) -> Result<(), StorageError> {
        let now = crate::config::now_rfc3339();
        self.conn.execute(
            "UPDATE procedural_memory SET usage_count = usage_count + 1, updated_at = ?2 WHERE workflow_id = ?1",
            params![workflow_id, now],
        )?;
        Ok(())
    }

    /// Returns the `k` stored workflows most similar to `query_embedding`,
    /// ranked descending by cosine similarity, via a full-table scan (see
    /// module-level doc on the absence of a native vector index).
    pub fn procedural_top_k_similar(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ProceduralMatch>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, trigger_embedding, trigger_pattern, successful_workflow, result_keys, usage_count
             FROM procedural_memory",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (workflow_id, embedding_blob, trigger_pattern, successful_workflow, result_keys_json, usage_count) =
                row?;
            let embedding = decode_embedding(&embedding_blob);
            let similarity = cosine_similarity(query_embedding, &embedding);
            let workflow = row_to_workflow(
                workflow_id,
                embedding_blob,
                trigger_pattern,
                successful_workflow,
                result_keys_json,
                usage_count,
            )?;
            matches.push(ProceduralMatch { workflow, similarity });
        }
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        Ok(matches)
    }

    /// Lists all stored workflows, newest-updated first, for `store workflows`.
    pub fn procedural_list(&self) -> Result<Vec<(ProceduralWorkflow, String)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_id, trigger_embedding, trigger_pattern, successful_workflow, result_keys, usage_count, updated_at
             FROM procedural_memory ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (workflow_id, embedding_blob, trigger_pattern, successful_workflow, result_keys_json, usage_count, updated_at) =
                row?;
            let workflow = row_to_workflow(
                workflow_id,
                embedding_blob,
                trigger_pattern,
                successful_workflow,
                result_keys_json,
                usage_count,
            )?;
            out.push((workflow, updated_at));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::setup_storage;
    use super::*;
    use crate::model::PlanStep;

    fn sample_plan() -> Vec<PlanStep> {
        vec![PlanStep {
            agent_name: "RetrievalQA".to_string(),
            input_template: serde_json::json!({"query": "{{goal}}"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }]
    }

    #[test]
    fn test_upsert_then_find_by_similarity() {
        let mut storage = setup_storage();
        storage
            .procedural_upsert(
                "wf-1",
                &[1.0, 0.0, 0.0],
                &sample_plan(),
                &["step_1_RetrievalQA".to_string()],
                Some("example pattern"),
            )
            .unwrap_or_else(|e| panic!("{e}"));

        let matches = storage
            .procedural_top_k_similar(&[1.0, 0.0, 0.0], 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].workflow.workflow_id, "wf-1");
        assert!(matches[0].similarity > 0.99);
        assert_eq!(matches[0].workflow.usage_count, 1);
    }

    #[test]
    fn test_bump_usage_increments_count() {
        let mut storage = setup_storage();
        storage
            .procedural_upsert("wf-2", &[0.0, 1.0], &[], &[], None)
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .procedural_bump_usage("wf-2")
            .unwrap_or_else(|e| panic!("{e}"));
        let matches = storage
            .procedural_top_k_similar(&[0.0, 1.0], 1)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches[0].workflow.usage_count, 2);
    }

    #[test]
    fn test_upsert_is_idempotent_on_workflow_id() {
        let mut storage = setup_storage();
        storage
            .procedural_upsert("wf-3", &[1.0, 0.0], &sample_plan(), &[], None)
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .procedural_upsert("wf-3", &[1.0, 0.0], &[], &["a".to_string()], None)
            .unwrap_or_else(|e| panic!("{e}"));
        let matches = storage
            .procedural_top_k_similar(&[1.0, 0.0], 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].workflow.result_keys, vec!["a".to_string()]);
    }

    #[test]
    fn test_upsert_on_conflict_increments_usage_count() {
        // R2: two upserts with the same workflow_id and different plans
        // leave the later plan observable and usage_count incremented by 2
        // from the pre-state (nonexistent, treated as 0).
        let mut storage = setup_storage();
        storage
            .procedural_upsert("wf-4", &[1.0, 0.0], &sample_plan(), &[], None)
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .procedural_upsert("wf-4", &[1.0, 0.0], &[], &["b".to_string()], None)
            .unwrap_or_else(|e| panic!("{e}"));
        let matches = storage
            .procedural_top_k_similar(&[1.0, 0.0], 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].workflow.usage_count, 2);
        assert_eq!(matches[0].workflow.result_keys, vec!["b".to_string()]);
    }

    #[test]
    fn test_top_k_truncates_and_ranks_descending() {
        let mut storage = setup_storage();
        storage
            .procedural_upsert("close", &[1.0, 0.1], &[], &[], None)
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .procedural_upsert("far", &[0.0, 1.0], &[], &[], None)
            .unwrap_or_else(|e| panic!("{e}"));
        let matches = storage
            .procedural_top_k_similar(&[1.0, 0.0], 1)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].workflow.workflow_id, "close");
    }
}
