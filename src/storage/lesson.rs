//! Lesson memory queries (C3): the step executor's pre-lesson read path and
//! the learner's write path over `lesson_memory`.

use rusqlite::params;

use crate::embedding::cosine_similarity;
use crate::error::StorageError;
use crate::model::{Lesson, LessonStatus};

use super::{decode_embedding, encode_embedding, SqliteStorage};

/// A lesson ranked against a query embedding.
#[derive(Debug, Clone)]
pub struct LessonMatch {
    /// The stored lesson.
    pub lesson: Lesson,
    /// Cosine similarity against the query embedding, in `[-1.0, 1.0]`.
    pub similarity: f32,
}

fn parse_status(raw: &str) -> Result<LessonStatus, StorageError> {
    match raw {
        "success" => Ok(LessonStatus::Success),
        "fail" => Ok(LessonStatus::Fail),
        other => Err(StorageError::CorruptRow {
            table: "lesson_memory",
            message: format!("unknown status {other:?}"),
        }),
    }
}

fn status_str(status: LessonStatus) -> &'static str {
    match status {
        LessonStatus::Success => "success",
        LessonStatus::Fail => "fail",
    }
}

impl SqliteStorage {
    /// Appends a new lesson. Lessons are never updated in place; repeated
    /// failures on the same (goal, agent) pairing accumulate as distinct rows.
    pub fn lesson_insert(&mut self, lesson: &Lesson) -> Result<(), StorageError> {
        let blob = encode_embedding(&lesson.trigger_embedding);
        let working_params_json = match &lesson.working_params {
            Some(map) => Some(serde_json::to_string(map).map_err(|e| StorageError::CorruptRow {
                table: "lesson_memory",
                message: format!("encoding working_params: {e}"),
            })?),
            None => None,
        };
        let now = crate::config::now_rfc3339();
        self.conn.execute(
            "INSERT INTO lesson_memory
                (lesson_id, trigger_embedding, goal_text, agent_name, status, error_snippet, fix_summary, working_params, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                lesson.lesson_id,
                blob,
                lesson.goal_text,
                lesson.agent_name,
                status_str(lesson.status),
                lesson.error_snippet,
                lesson.fix_summary,
                working_params_json,
                now,
            ],
        )?;
        Ok(())
    }

    /// Returns the `k` lessons most similar to `query_embedding`, optionally
    /// restricted to a single `agent_name`, ranked descending by similarity.
    pub fn lesson_top_k_similar(
        &self,
        query_embedding: &[f32],
        agent_name: Option<&str>,
        k: usize,
    ) -> Result<Vec<LessonMatch>, StorageError> {
        let sql = match agent_name {
            Some(_) => {
                "SELECT lesson_id, trigger_embedding, goal_text, agent_name, status, error_snippet, fix_summary, working_params
                 FROM lesson_memory WHERE agent_name = ?1"
            }
            None => {
                "SELECT lesson_id, trigger_embedding, goal_text, agent_name, status, error_snippet, fix_summary, working_params
                 FROM lesson_memory"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        };
        let rows = if let Some(agent) = agent_name {
            stmt.query_map(params![agent], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut matches = Vec::with_capacity(rows.len());
        for (lesson_id, embedding_blob, goal_text, agent_name, status, error_snippet, fix_summary, working_params_json) in rows {
            let embedding = decode_embedding(&embedding_blob);
            let similarity = cosine_similarity(query_embedding, &embedding);
            let working_params = match working_params_json {
                Some(json) => Some(serde_json::from_str(&json).map_err(|e| StorageError::CorruptRow {
                    table: "lesson_memory",
                    message: format!("working_params column: {e}"),
                })?),
                None => None,
            };
            let lesson = Lesson {
                lesson_id,
                trigger_embedding: embedding,
                goal_text,
                agent_name,
                status: parse_status(&status)?,
                error_snippet,
                fix_summary,
                working_params,
            };
            matches.push(LessonMatch { lesson, similarity });
        }
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(k);
        Ok(matches)
    }

    /// Lists all stored lessons, newest-created first, for `store lessons`.
    pub fn lesson_list(&self) -> Result<Vec<(Lesson, String)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT lesson_id, trigger_embedding, goal_text, agent_name, status, error_snippet, fix_summary, working_params, created_at
             FROM lesson_memory ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (lesson_id, embedding_blob, goal_text, agent_name, status, error_snippet, fix_summary, working_params_json, created_at) =
                row?;
            let working_params = match working_params_json {
                Some(json) => Some(serde_json::from_str(&json).map_err(|e| StorageError::CorruptRow {
                    table: "lesson_memory",
                    message: format!("working_params column: {e}"),
                })?),
                None => None,
            };
            let lesson = Lesson {
                lesson_id,
                trigger_embedding: decode_embedding(&embedding_blob),
                goal_text,
                agent_name,
                status: parse_status(&status)?,
                error_snippet,
                fix_summary,
                working_params,
            };
            out.push((lesson, created_at));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::setup_storage;
    use super::*;

    fn sample_lesson(id: &str, embedding: Vec<f32>, status: LessonStatus) -> Lesson {
        Lesson {
            lesson_id: id.to_string(),
            trigger_embedding: embedding,
            goal_text: "summarize quarterly earnings".to_string(),
            agent_name: "DatabaseQuery".to_string(),
            status,
            error_snippet: (status == LessonStatus::Fail).then(|| "syntax error near FROM".to_string()),
            fix_summary: (status == LessonStatus::Fail).then(|| "quote table names".to_string()),
            working_params: None,
        }
    }

    #[test]
    fn test_insert_then_find_by_similarity() {
        let mut storage = setup_storage();
        storage
            .lesson_insert(&sample_lesson("l-1", vec![1.0, 0.0], LessonStatus::Fail))
            .unwrap_or_else(|e| panic!("{e}"));

        let matches = storage
            .lesson_top_k_similar(&[1.0, 0.0], None, 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].lesson.lesson_id, "l-1");
        assert_eq!(matches[0].lesson.status, LessonStatus::Fail);
        assert!(matches[0].similarity > 0.99);
    }

    #[test]
    fn test_agent_name_filter_excludes_other_agents() {
        let mut storage = setup_storage();
        storage
            .lesson_insert(&sample_lesson("l-2", vec![1.0, 0.0], LessonStatus::Fail))
            .unwrap_or_else(|e| panic!("{e}"));
        let mut other = sample_lesson("l-3", vec![1.0, 0.0], LessonStatus::Success);
        other.agent_name = "WebSearch".to_string();
        storage.lesson_insert(&other).unwrap_or_else(|e| panic!("{e}"));

        let matches = storage
            .lesson_top_k_similar(&[1.0, 0.0], Some("WebSearch"), 5)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].lesson.lesson_id, "l-3");
    }

    #[test]
    fn test_lesson_list_orders_newest_first() {
        let mut storage = setup_storage();
        storage
            .lesson_insert(&sample_lesson("l-6", vec![1.0, 0.0], LessonStatus::Fail))
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .lesson_insert(&sample_lesson("l-7", vec![0.0, 1.0], LessonStatus::Success))
            .unwrap_or_else(|e| panic!("{e}"));
        let listed = storage.lesson_list().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn test_lessons_accumulate_without_overwrite() {
        let mut storage = setup_storage();
        storage
            .lesson_insert(&sample_lesson("l-4", vec![1.0, 0.0], LessonStatus::Fail))
            .unwrap_or_else(|e| panic!("{e}"));
        storage
            .lesson_insert(&sample_lesson("l-5", vec![1.0, 0.0], LessonStatus::Fail))
            .unwrap_or_else(|e| panic!("{e}"));
        let matches = storage
            .lesson_top_k_similar(&[1.0, 0.0], None, 10)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(matches.len(), 2);
    }
}
