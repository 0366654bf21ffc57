use common::error::KgAgentError;
use common::llm::LlmCapability;
use common::storage::db::SurrealDbClient;
use common::storage::types::column::Column;
use common::storage::types::table::Table;
use common::storage::types::vector_embedding::{EmbeddingEntityType, VectorEmbedding};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

#[derive(Clone)]
pub struct VectorIndex {
    db: Arc<SurrealDbClient>,
}

#[derive(Debug, Clone)]
pub struct ScoredEntity {
    pub entity_id: String,
    pub entity_type: EmbeddingEntityType,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct ScoredRow {
    entity_id: String,
    entity_type: EmbeddingEntityType,
    text: String,
    score: f32,
    metadata: Value,
}

impl VectorIndex {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Writes one embedding row. Storage only, no search-graph linkage is needed since
    /// `entity_id` already points back at the owning table/column/query-log row.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "trace", skip(self, vector, metadata))]
    pub async fn store(
        &self,
        kg_id: &str,
        entity_type: EmbeddingEntityType,
        entity_id: String,
        text: String,
        vector: Vec<f32>,
        model_id: String,
        metadata: Value,
    ) -> Result<(), KgAgentError> {
        let dim = vector.len();
        let embedding = VectorEmbedding::new(
            kg_id.to_string(),
            entity_type,
            entity_id,
            text,
            vector,
            model_id,
            dim,
            metadata,
        );
        self.db.store_item(embedding).await?;
        Ok(())
    }

    pub async fn store_all(&self, embeddings: Vec<VectorEmbedding>) -> Result<(), KgAgentError> {
        if embeddings.is_empty() {
            return Ok(());
        }
        self.db
            .client
            .query(
                "BEGIN TRANSACTION; FOR $row IN $rows { CREATE type::thing('kg_embeddings', $row.id) CONTENT $row; }; COMMIT TRANSACTION;",
            )
            .bind(("rows", embeddings))
            .await?
            .check()?;
        Ok(())
    }

    /// True once at least one embedding row exists for this KG, meaning a rebuild doesn't
    /// need to re-embed everything from scratch.
    pub async fn is_populated(&self, kg_id: &str) -> Result<bool, KgAgentError> {
        let mut response = self
            .db
            .client
            .query("SELECT count() AS count FROM kg_embeddings WHERE kg_id = $kg_id GROUP ALL")
            .bind(("kg_id", kg_id.to_string()))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count) > 0)
    }

    /// Approximate nearest-neighbour search scoped to a single KG and optionally an
    /// entity type, mirroring the `<|k,ef|>` HNSW operator paired with an explicit
    /// cosine-similarity projection for the returned score.
    #[instrument(level = "trace", skip(self, query_vector))]
    pub async fn search(
        &self,
        kg_id: &str,
        query_vector: Vec<f32>,
        entity_type: Option<EmbeddingEntityType>,
        k: usize,
    ) -> Result<Vec<ScoredEntity>, KgAgentError> {
        let ef = (k * 10).max(40);
        let type_filter = if entity_type.is_some() {
            "AND entity_type = $entity_type "
        } else {
            ""
        };

        let query = format!(
            "SELECT entity_id, entity_type, text, metadata, \
             vector::similarity::cosine(vector, $query_vector) AS score \
             FROM kg_embeddings \
             WHERE kg_id = $kg_id {type_filter}\
             AND vector <|{k},{ef}|> $query_vector \
             ORDER BY score DESC LIMIT {k}"
        );

        let mut request = self
            .db
            .client
            .query(query)
            .bind(("kg_id", kg_id.to_string()))
            .bind(("query_vector", query_vector));

        if let Some(entity_type) = entity_type {
            request = request.bind(("entity_type", entity_type));
        }

        let rows: Vec<ScoredRow> = request.await?.take(0)?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredEntity {
                entity_id: row.entity_id,
                entity_type: row.entity_type,
                text: row.text,
                score: row.score,
                metadata: row.metadata,
            })
            .collect())
    }

    /// Rebuilds the collection for one KG from the durable store's tables/columns when no
    /// embeddings exist yet, reproducing the same ids, metadata, and document text that a
    /// fresh build would have written. No-op (idempotent) if the collection is already
    /// populated.
    #[instrument(level = "trace", skip(self, tables, columns, llm))]
    pub async fn ensure_populated(
        &self,
        kg_id: &str,
        tables: &[Table],
        columns: &[Column],
        llm: &dyn LlmCapability,
        model_id: &str,
    ) -> Result<(), KgAgentError> {
        if self.is_populated(kg_id).await? {
            return Ok(());
        }

        let mut embeddings = Vec::new();
        for table in tables {
            let document = table.document();
            let vector = llm.embed(&document).await?;
            let dim = vector.len();
            embeddings.push(VectorEmbedding::new(
                kg_id.to_string(),
                EmbeddingEntityType::Table,
                format!("table_{}", table.name),
                document,
                vector,
                model_id.to_string(),
                dim,
                table.metadata(),
            ));
        }

        for column in columns {
            if !column.is_embeddable() {
                continue;
            }
            let document = column.document();
            let vector = llm.embed(&document).await?;
            let dim = vector.len();
            embeddings.push(VectorEmbedding::new(
                kg_id.to_string(),
                EmbeddingEntityType::Column,
                format!("column_{}", column.qualified_name.replace('.', "_")),
                document,
                vector,
                model_id.to_string(),
                dim,
                column.metadata(),
            ));
        }

        self.store_all(embeddings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::db::SurrealDbClient;
    use uuid::Uuid;

    #[tokio::test]
    async fn store_and_search_roundtrip() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("start in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");

        let index = VectorIndex::new(db);
        assert!(!index.is_populated("kg1").await.unwrap());

        index
            .store(
                "kg1",
                EmbeddingEntityType::Table,
                "table_orders".to_string(),
                "Table: orders".to_string(),
                vec![1.0, 0.0, 0.0],
                "test-model".to_string(),
                serde_json::json!({"entity_type": "table", "table_name": "orders"}),
            )
            .await
            .expect("store embedding");

        assert!(index.is_populated("kg1").await.unwrap());

        let results = index
            .search("kg1", vec![1.0, 0.0, 0.0], Some(EmbeddingEntityType::Table), 5)
            .await
            .expect("search");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity_id, "table_orders");
        assert_eq!(results[0].metadata["table_name"], "orders");
    }
}
