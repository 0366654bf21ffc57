use std::sync::Arc;

use common::error::KgAgentError;
use common::storage::db::SurrealDbClient;
use common::storage::types::error_pattern::ErrorPattern;
use common::storage::types::query_log::QueryLog;
use common::storage::types::StoredObject;
use serde::Deserialize;
use surrealdb::opt::PatchOp;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct ScoredQueryLog {
    pub log: QueryLog,
    pub similarity: f32,
}

#[derive(Debug, Deserialize)]
struct ScoredQueryLogRow {
    #[serde(flatten)]
    log: QueryLog,
    distance: f32,
}

/// Durable record of past query attempts and the recurring error patterns extracted
/// from them, shared by the SQL-generator and error-router agents as retrieval context.
#[derive(Clone)]
pub struct QueryMemory {
    db: Arc<SurrealDbClient>,
}

impl QueryMemory {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    #[instrument(level = "trace", skip(self, log))]
    pub async fn insert(&self, log: QueryLog) -> Result<QueryLog, KgAgentError> {
        self.db
            .store_item(log)
            .await?
            .ok_or_else(|| KgAgentError::InternalError("query log insert returned no row".into()))
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get(&self, query_id: &str) -> Result<Option<QueryLog>, KgAgentError> {
        Ok(self.db.get_item::<QueryLog>(query_id).await?)
    }

    /// Cosine-distance ANN search over successful (by default) query embeddings, skipping
    /// rows with no embedding. `similarity = 1 - distance/2` normalizes cosine distance to 0..1.
    #[instrument(level = "trace", skip(self, query_vector))]
    pub async fn search_similar(
        &self,
        kg_id: &str,
        query_vector: Vec<f32>,
        k: usize,
        only_successful: bool,
    ) -> Result<Vec<ScoredQueryLog>, KgAgentError> {
        let ef = (k * 10).max(40);
        let success_filter = if only_successful { "AND success = true " } else { "" };

        let query = format!(
            "SELECT *, vector::distance::cosine(query_embedding, $query_vector) AS distance \
             FROM kg_query_log \
             WHERE kg_id = $kg_id {success_filter}\
             AND query_embedding != NONE \
             AND query_embedding <|{k},{ef}|> $query_vector \
             ORDER BY distance ASC LIMIT {k}"
        );

        let rows: Vec<ScoredQueryLogRow> = self
            .db
            .client
            .query(query)
            .bind(("kg_id", kg_id.to_string()))
            .bind(("query_vector", query_vector))
            .await?
            .take(0)?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredQueryLog {
                similarity: 1.0 - row.distance / 2.0,
                log: row.log,
            })
            .collect())
    }

    #[instrument(level = "trace", skip(self, text))]
    pub async fn update_feedback(
        &self,
        query_id: &str,
        text: String,
        rating: Option<u8>,
    ) -> Result<(), KgAgentError> {
        let updated: Option<QueryLog> = self
            .db
            .client
            .update((QueryLog::table_name(), query_id))
            .patch(PatchOp::replace("/user_feedback", text))
            .patch(PatchOp::replace("/feedback_rating", rating))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::from(chrono::Utc::now()),
            ))
            .await?;
        updated
            .map(|_| ())
            .ok_or_else(|| KgAgentError::NotFound(format!("query log {query_id}")))
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn record_error_pattern(
        &self,
        kg_id: &str,
        category: &str,
        description: String,
        example_error: Option<String>,
        fix_applied: Option<String>,
        affected_tables: Vec<String>,
    ) -> Result<(), KgAgentError> {
        let existing: Vec<ErrorPattern> = self
            .db
            .client
            .query(
                "SELECT * FROM query_error_patterns \
                 WHERE kg_id = $kg_id AND description = $description AND is_active = true",
            )
            .bind(("kg_id", kg_id.to_string()))
            .bind(("description", description.clone()))
            .await?
            .take(0)?;

        if let Some(pattern) = existing.into_iter().next() {
            let occurrence_count = pattern.occurrence_count + 1;
            let _updated: Option<ErrorPattern> = self
                .db
                .client
                .update((ErrorPattern::table_name(), pattern.id.as_str()))
                .patch(PatchOp::replace("/occurrence_count", occurrence_count))
                .patch(PatchOp::replace("/fix_applied", fix_applied))
                .patch(PatchOp::replace(
                    "/last_seen",
                    surrealdb::sql::Datetime::from(chrono::Utc::now()),
                ))
                .await?;
            return Ok(());
        }

        let pattern = ErrorPattern::new(
            kg_id.to_string(),
            category.to_string(),
            description,
            example_error,
            fix_applied,
            affected_tables,
        );
        self.db.store_item(pattern).await?;
        Ok(())
    }

    /// Active patterns for this KG, newest/most-frequent first, optionally filtered by
    /// category and by overlap with a set of affected tables.
    #[instrument(level = "trace", skip(self))]
    pub async fn get_patterns(
        &self,
        kg_id: &str,
        category: Option<&str>,
        affected_tables: Option<&[String]>,
        k: usize,
    ) -> Result<Vec<ErrorPattern>, KgAgentError> {
        let mut patterns: Vec<ErrorPattern> = self
            .db
            .client
            .query("SELECT * FROM query_error_patterns WHERE kg_id = $kg_id AND is_active = true")
            .bind(("kg_id", kg_id.to_string()))
            .await?
            .take(0)?;

        if let Some(category) = category {
            patterns.retain(|p| p.category == category);
        }
        if let Some(affected_tables) = affected_tables {
            patterns.retain(|p| p.affected_tables.iter().any(|t| affected_tables.contains(t)));
        }

        patterns.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        patterns.truncate(k);
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn insert_and_update_feedback_roundtrip() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("query_memory_test", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");
        let memory = QueryMemory::new(db);

        let log = QueryLog::new("kg1".to_string(), "how many orders last month?".to_string());
        let stored = memory.insert(log).await.expect("insert query log");

        memory
            .update_feedback(&stored.id, "great answer".to_string(), Some(5))
            .await
            .expect("update feedback");
    }

    #[tokio::test]
    async fn record_error_pattern_dedups_on_description_not_category() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("query_memory_patterns", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");
        let memory = QueryMemory::new(db);

        memory
            .record_error_pattern(
                "kg1",
                "schema_error",
                "column not found".to_string(),
                Some("column orders.total does not exist".to_string()),
                Some("re-selected tables".to_string()),
                vec!["orders".to_string()],
            )
            .await
            .expect("record pattern");
        memory
            .record_error_pattern(
                "kg1",
                "schema_error",
                "column not found".to_string(),
                None,
                Some("re-selected tables".to_string()),
                vec!["orders".to_string()],
            )
            .await
            .expect("record repeated pattern");
        memory
            .record_error_pattern(
                "kg1",
                "schema_error",
                "a distinct column is missing entirely".to_string(),
                None,
                None,
                vec!["orders".to_string()],
            )
            .await
            .expect("record distinct pattern");

        let patterns = memory
            .get_patterns("kg1", Some("schema_error"), Some(&["orders".to_string()]), 5)
            .await
            .expect("get patterns");
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].occurrence_count, 2);
    }
}
