use std::collections::HashMap;
use std::sync::Arc;

use common::error::KgAgentError;
use common::llm::{LlmCapability, LlmCapabilityExt, StructuredRequest};
use common::storage::db::SurrealDbClient;
use common::storage::types::error_summary::ErrorSummary;
use common::storage::types::StoredObject;
use serde::Deserialize;
use serde_json::json;
use surrealdb::opt::PatchOp;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LessonType {
    Schema,
    Sql,
}

#[derive(Debug, Deserialize)]
struct LessonExtraction {
    lesson_type: String,
    lesson_rule: String,
}

#[derive(Debug, Deserialize)]
struct CompressedLessons {
    compressed: String,
}

/// Accumulates short, numbered "lessons learned" rule lists per KG from query failures and
/// negative feedback, and keeps them compact via background compression so prompts built
/// from them stay bounded in size.
pub struct ErrorSummaryManager {
    db: Arc<SurrealDbClient>,
    compression_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ErrorSummaryManager {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            compression_locks: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get_or_create(&self, kg_id: &str, compression_threshold: usize) -> Result<ErrorSummary, KgAgentError> {
        if let Some(existing) = self.db.get_item::<ErrorSummary>(kg_id).await? {
            return Ok(existing);
        }
        let summary = ErrorSummary::new(kg_id.to_string(), compression_threshold);
        self.db
            .store_item(summary)
            .await?
            .ok_or_else(|| KgAgentError::InternalError("error summary insert returned no row".into()))
    }

    /// Appends a lesson derived from a query execution failure, then triggers compression
    /// if the corresponding field crossed the configured word threshold.
    #[instrument(level = "trace", skip(self, llm))]
    pub async fn append_from_error(
        &self,
        kg_id: &str,
        error_message: &str,
        category: &str,
        fix_applied: Option<&str>,
        affected_tables: &[String],
        sql: &str,
        llm: &dyn LlmCapability,
    ) -> Result<(), KgAgentError> {
        let request = StructuredRequest {
            schema_name: "lesson_from_error",
            schema_description: "A short generalized rule learned from a query execution failure",
            schema: lesson_schema(),
            system_prompt: "You extract a short, generalizable lesson (at most 30 words) from a SQL query failure, to help a future query avoid the same mistake. Classify it as a `schema` lesson (about table/column structure) or a `sql` lesson (about query construction).",
            user_prompt: format!(
                "Error: {error_message}\nCategory: {category}\nFix applied: {}\nAffected tables: {:?}\nSQL: {sql}",
                fix_applied.unwrap_or("none"),
                affected_tables
            ),
        };

        let extraction: LessonExtraction = llm.complete_structured(request).await?;
        self.append_lesson(kg_id, &extraction).await
    }

    /// Appends a lesson derived from user feedback. Callers are expected to gate this to
    /// negative feedback (rating <= 2, or an explicitly negative verdict) or a failed query;
    /// this function does not re-check that condition.
    #[instrument(level = "trace", skip(self, llm))]
    pub async fn append_from_feedback(
        &self,
        kg_id: &str,
        user_question: &str,
        sql: &str,
        success: bool,
        feedback_text: &str,
        rating: Option<u8>,
        llm: &dyn LlmCapability,
    ) -> Result<(), KgAgentError> {
        let request = StructuredRequest {
            schema_name: "lesson_from_feedback",
            schema_description: "A short generalized rule learned from negative user feedback on a query",
            schema: lesson_schema(),
            system_prompt: "You extract a short, generalizable lesson (at most 30 words) from negative user feedback on a generated SQL query. Classify it as a `schema` lesson or a `sql` lesson.",
            user_prompt: format!(
                "Question: {user_question}\nSQL: {sql}\nExecution succeeded: {success}\nFeedback: {feedback_text}\nRating: {:?}",
                rating
            ),
        };

        let extraction: LessonExtraction = llm.complete_structured(request).await?;
        self.append_lesson(kg_id, &extraction).await
    }

    async fn append_lesson(&self, kg_id: &str, extraction: &LessonExtraction) -> Result<(), KgAgentError> {
        let lesson_type = parse_lesson_type(&extraction.lesson_type);
        let mut summary = self.get_or_create(kg_id, default_threshold()).await?;

        let numbered = format!("{}. {}", summary.lesson_count + 1, extraction.lesson_rule.trim());
        match lesson_type {
            LessonType::Schema => append_numbered(&mut summary.schema_lessons, &numbered),
            LessonType::Sql => append_numbered(&mut summary.sql_lessons, &numbered),
        }
        summary.lesson_count += 1;
        summary.recompute_word_count();

        self.persist(&summary).await?;
        info!(kg_id, lesson_type = ?lesson_type, word_count = summary.word_count, "appended lesson");

        if summary.needs_compression() {
            info!(kg_id, "lesson word count crossed compression threshold; caller should run compress_if_needed");
        }

        Ok(())
    }

    async fn persist(&self, summary: &ErrorSummary) -> Result<(), KgAgentError> {
        let _updated: Option<ErrorSummary> = self
            .db
            .client
            .update((ErrorSummary::table_name(), summary.id.as_str()))
            .patch(PatchOp::replace("/schema_lessons", summary.schema_lessons.clone()))
            .patch(PatchOp::replace("/sql_lessons", summary.sql_lessons.clone()))
            .patch(PatchOp::replace("/lesson_count", summary.lesson_count))
            .patch(PatchOp::replace("/word_count", summary.word_count))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::from(chrono::Utc::now()),
            ))
            .await?;
        Ok(())
    }

    /// Checks whether compression is due and, if so, runs it. At most one compression
    /// per KG runs at a time; a concurrent caller simply waits for the lock rather than
    /// compressing twice.
    #[instrument(level = "trace", skip(self, llm))]
    pub async fn compress_if_needed(&self, kg_id: &str, llm: &dyn LlmCapability) -> Result<bool, KgAgentError> {
        let lock = self.lock_for(kg_id).await;
        let _guard = lock.lock().await;

        let summary = self.get_or_create(kg_id, default_threshold()).await?;
        if !summary.needs_compression() {
            return Ok(false);
        }

        self.compress(kg_id, llm).await?;
        Ok(true)
    }

    async fn compress(&self, kg_id: &str, llm: &dyn LlmCapability) -> Result<(), KgAgentError> {
        let mut summary = self.get_or_create(kg_id, default_threshold()).await?;
        let target_words = (summary.compression_threshold / 4).max(10);

        if !summary.schema_lessons.is_empty() {
            summary.schema_lessons = self.compress_field(&summary.schema_lessons, target_words, llm).await?;
        }
        if !summary.sql_lessons.is_empty() {
            summary.sql_lessons = self.compress_field(&summary.sql_lessons, target_words, llm).await?;
        }
        summary.recompute_word_count();
        summary.version += 1;
        summary.last_compressed_at = Some(chrono::Utc::now());

        let _updated: Option<ErrorSummary> = self
            .db
            .client
            .update((ErrorSummary::table_name(), summary.id.as_str()))
            .patch(PatchOp::replace("/schema_lessons", summary.schema_lessons.clone()))
            .patch(PatchOp::replace("/sql_lessons", summary.sql_lessons.clone()))
            .patch(PatchOp::replace("/word_count", summary.word_count))
            .patch(PatchOp::replace("/version", summary.version))
            .patch(PatchOp::replace(
                "/last_compressed_at",
                surrealdb::sql::Datetime::from(summary.last_compressed_at.unwrap()),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::from(chrono::Utc::now()),
            ))
            .await?;

        info!(kg_id, new_word_count = summary.word_count, version = summary.version, "compressed error summary");
        Ok(())
    }

    async fn compress_field(&self, field: &str, target_words: usize, llm: &dyn LlmCapability) -> Result<String, KgAgentError> {
        let request = StructuredRequest {
            schema_name: "lesson_compression",
            schema_description: "A compacted, numbered list of lessons merging similar rules",
            schema: json!({
                "type": "object",
                "properties": {"compressed": {"type": "string"}},
                "required": ["compressed"],
                "additionalProperties": false
            }),
            system_prompt: "You compress a numbered list of short lessons down to roughly the target word count by merging 2-3 similar rules into one generalized rule each. Keep the numbered list format.",
            user_prompt: format!("Target word count: {target_words}\nLessons:\n{field}"),
        };

        match llm.complete_structured::<CompressedLessons>(request).await {
            Ok(compressed) => Ok(compressed.compressed),
            Err(err) => {
                warn!(error = %err, "lesson compression failed; keeping field uncompressed");
                Ok(field.to_string())
            }
        }
    }

    async fn lock_for(&self, kg_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.compression_locks.lock().await;
        locks.entry(kg_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

fn lesson_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "lesson_type": {"type": "string", "enum": ["schema", "sql"]},
            "lesson_rule": {"type": "string"}
        },
        "required": ["lesson_type", "lesson_rule"],
        "additionalProperties": false
    })
}

fn parse_lesson_type(raw: &str) -> LessonType {
    if raw.eq_ignore_ascii_case("schema") {
        LessonType::Schema
    } else {
        LessonType::Sql
    }
}

fn append_numbered(field: &mut String, numbered_line: &str) {
    if field.is_empty() {
        field.push_str(numbered_line);
    } else {
        field.push('\n');
        field.push_str(numbered_line);
    }
}

fn default_threshold() -> usize {
    500
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::test_utils::FakeLlm;
    use uuid::Uuid;

    #[tokio::test]
    async fn append_from_error_grows_schema_lessons() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("error_summary_test", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");
        let manager = ErrorSummaryManager::new(db);

        let llm = FakeLlm::new(
            vec![json!({"lesson_type": "schema", "lesson_rule": "orders has no column named total, use amount"}).to_string()],
            3,
        );

        manager
            .append_from_error(
                "kg1",
                "column orders.total does not exist",
                "schema_error",
                None,
                &["orders".to_string()],
                "SELECT total FROM orders",
                &llm,
            )
            .await
            .expect("append lesson");

        let summary = manager.get_or_create("kg1", 500).await.expect("load summary");
        assert_eq!(summary.lesson_count, 1);
        assert!(summary.schema_lessons.starts_with("1. "));
        assert!(summary.sql_lessons.is_empty());
    }

    #[tokio::test]
    async fn compress_if_needed_is_noop_below_threshold() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("error_summary_compress", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");
        let manager = ErrorSummaryManager::new(db);
        manager.get_or_create("kg1", 500).await.expect("create summary");

        let llm = FakeLlm::new(vec![], 3);
        let compressed = manager.compress_if_needed("kg1", &llm).await.expect("check compression");
        assert!(!compressed);
    }
}
