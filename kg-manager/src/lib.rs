use std::collections::HashMap;
use std::sync::Arc;

use common::error::KgAgentError;
use common::llm::LlmCapability;
use common::storage::types::column::Column;
use common::storage::types::knowledge_graph::KnowledgeGraph;
use common::storage::types::relationship::Relationship;
use common::storage::types::table::Table;
use kg_store::{KgRepository, VectorIndex};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, instrument, warn};

/// Fully-rehydrated, in-memory view of one knowledge graph: every table, its columns,
/// and every relationship, keyed for cheap lookup by the agents that consume it.
#[derive(Debug, Clone)]
pub struct LoadedKg {
    pub kg: KnowledgeGraph,
    pub tables: Vec<Table>,
    pub columns_by_table: HashMap<String, Vec<Column>>,
    pub relationships: Vec<Relationship>,
}

impl LoadedKg {
    pub fn table_by_id(&self, table_id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == table_id)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn columns_for(&self, table_id: &str) -> &[Column] {
        self.columns_by_table.get(table_id).map_or(&[], |c| c.as_slice())
    }
}

/// Caches loaded KGs in memory, guaranteeing at most one rehydration in flight per
/// `kg_id`. Cache eviction policy is deliberately left unspecified: correctness never
/// depends on whether an entry is present.
pub struct KgManager {
    repository: KgRepository,
    vector_index: VectorIndex,
    embedding_model_id: String,
    cache: RwLock<HashMap<String, Arc<OnceCell<Option<Arc<LoadedKg>>>>>>,
}

impl KgManager {
    pub fn new(repository: KgRepository, vector_index: VectorIndex, embedding_model_id: String) -> Self {
        Self {
            repository,
            vector_index,
            embedding_model_id,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `llm` is used to rebuild the vector index from the durable store when a KG's
    /// embeddings are missing; pass `None` to skip that rebuild (the cached KG will then
    /// have an empty vector index, degrading schema selection to its fallback path).
    #[instrument(level = "trace", skip(self, llm))]
    pub async fn load(&self, kg_id: &str, llm: Option<&dyn LlmCapability>) -> Result<Option<Arc<LoadedKg>>, KgAgentError> {
        let cell = self.cell_for(kg_id).await;

        let loaded = cell
            .get_or_try_init(|| async { self.rehydrate(kg_id, llm).await.map(|loaded| loaded.map(Arc::new)) })
            .await?;

        Ok(loaded.clone())
    }

    /// Drops the cache entry for a KG, forcing the next `load` to rehydrate from storage.
    /// Call this after a rebuild or schema change.
    pub async fn invalidate(&self, kg_id: &str) {
        self.cache.write().await.remove(kg_id);
    }

    async fn cell_for(&self, kg_id: &str) -> Arc<OnceCell<Option<Arc<LoadedKg>>>> {
        if let Some(cell) = self.cache.read().await.get(kg_id) {
            return cell.clone();
        }
        let mut cache = self.cache.write().await;
        cache
            .entry(kg_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn rehydrate(&self, kg_id: &str, llm: Option<&dyn LlmCapability>) -> Result<Option<LoadedKg>, KgAgentError> {
        let Some(kg) = self.repository.get_kg(kg_id).await? else {
            return Ok(None);
        };

        let tables = self.repository.get_tables(kg_id).await?;
        let relationships = self.repository.get_relationships(kg_id).await?;

        let mut columns_by_table = HashMap::with_capacity(tables.len());
        let mut all_columns: Vec<Column> = Vec::new();
        for table in &tables {
            let columns = self.repository.get_columns(&table.id).await?;
            all_columns.extend(columns.iter().cloned());
            columns_by_table.insert(table.id.clone(), columns);
        }

        if !self.vector_index.is_populated(kg_id).await? {
            match llm {
                Some(llm) => {
                    warn!(kg_id, "vector index empty; rebuilding from durable store");
                    self.vector_index
                        .ensure_populated(kg_id, &tables, &all_columns, llm, &self.embedding_model_id)
                        .await?;
                }
                None => {
                    warn!(kg_id, "knowledge graph marked ready but vector index has no embeddings, and no llm was provided to rebuild it");
                }
            }
        }

        debug!(kg_id, tables = tables.len(), "rehydrated knowledge graph into cache");

        Ok(Some(LoadedKg {
            kg,
            tables,
            columns_by_table,
            relationships,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::knowledge_graph::KgStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn load_caches_and_returns_none_for_missing_kg() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("kg_manager_test", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized(3).await.expect("ensure indexes");

        let repository = KgRepository::new(db.clone());
        let vector_index = VectorIndex::new(db.clone());
        let manager = KgManager::new(repository.clone(), vector_index, "test-model".to_string());

        assert!(manager.load("missing", None).await.unwrap().is_none());

        let (kg, _) = repository
            .create_or_get("localhost".into(), 5432, "orders_db".into(), "public".into())
            .await
            .unwrap();
        repository
            .mark_status(kg.clone(), KgStatus::Ready, None)
            .await
            .unwrap();

        let loaded = manager.load(&kg.id, None).await.unwrap();
        assert!(loaded.is_some());
        assert_eq!(loaded.unwrap().kg.id, kg.id);
    }
}
