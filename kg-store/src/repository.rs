use std::sync::Arc;

use common::error::KgAgentError;
use common::storage::db::SurrealDbClient;
use common::storage::types::column::Column;
use common::storage::types::knowledge_graph::{KgStatus, KnowledgeGraph};
use common::storage::types::relationship::Relationship;
use common::storage::types::table::Table;
use common::storage::types::StoredObject;
use surrealdb::opt::PatchOp;
use tracing::instrument;

#[derive(Clone)]
pub struct KgRepository {
    db: Arc<SurrealDbClient>,
}

#[derive(Debug, Clone)]
pub struct TableContext {
    pub table: Table,
    pub columns: Vec<Column>,
    pub relationships: Vec<Relationship>,
}

impl KgRepository {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Returns the existing KG for this fingerprint if one was already built, otherwise
    /// creates and returns a fresh `building` row. The fingerprint doubles as the row id,
    /// so this lookup-then-create is itself the idempotency guarantee.
    #[instrument(level = "trace", skip(self))]
    pub async fn create_or_get(
        &self,
        host: String,
        port: u16,
        database_name: String,
        schema_namespace: String,
    ) -> Result<(KnowledgeGraph, bool), KgAgentError> {
        let fingerprint = KnowledgeGraph::fingerprint(&host, port, &database_name);
        if let Some(existing) = self.db.get_item::<KnowledgeGraph>(&fingerprint).await? {
            return Ok((existing, false));
        }

        let kg = KnowledgeGraph::new(host, port, database_name, schema_namespace);
        let stored = self
            .db
            .store_item(kg)
            .await?
            .ok_or_else(|| KgAgentError::InternalError("kg insert returned no row".into()))?;
        Ok((stored, true))
    }

    pub async fn get_kg(&self, kg_id: &str) -> Result<Option<KnowledgeGraph>, KgAgentError> {
        Ok(self.db.get_item::<KnowledgeGraph>(kg_id).await?)
    }

    pub async fn list_kgs(&self) -> Result<Vec<KnowledgeGraph>, KgAgentError> {
        Ok(self.db.get_all_stored_items::<KnowledgeGraph>().await?)
    }

    pub async fn mark_status(
        &self,
        kg: KnowledgeGraph,
        status: KgStatus,
        error_message: Option<String>,
    ) -> Result<KnowledgeGraph, KgAgentError> {
        let updated: Option<KnowledgeGraph> = self
            .db
            .client
            .update((KnowledgeGraph::table_name(), kg.id.as_str()))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/error_message", error_message))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::from(chrono::Utc::now()),
            ))
            .await?;
        updated.ok_or_else(|| KgAgentError::InternalError("kg update returned no row".into()))
    }

    #[instrument(level = "trace", skip(self, tables))]
    pub async fn insert_tables(&self, tables: &[Table]) -> Result<(), KgAgentError> {
        batch_insert(&self.db, Table::table_name(), tables).await
    }

    #[instrument(level = "trace", skip(self, columns))]
    pub async fn insert_columns(&self, columns: &[Column]) -> Result<(), KgAgentError> {
        batch_insert(&self.db, Column::table_name(), columns).await
    }

    #[instrument(level = "trace", skip(self, relationships))]
    pub async fn insert_relationships(&self, relationships: &[Relationship]) -> Result<(), KgAgentError> {
        batch_insert(&self.db, Relationship::table_name(), relationships).await
    }

    pub async fn get_tables(&self, kg_id: &str) -> Result<Vec<Table>, KgAgentError> {
        let mut response = self
            .db
            .client
            .query("SELECT * FROM kg_tables WHERE kg_id = $kg_id")
            .bind(("kg_id", kg_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn get_columns(&self, table_id: &str) -> Result<Vec<Column>, KgAgentError> {
        let mut response = self
            .db
            .client
            .query("SELECT * FROM kg_columns WHERE table_id = $table_id ORDER BY position")
            .bind(("table_id", table_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn get_relationships(&self, kg_id: &str) -> Result<Vec<Relationship>, KgAgentError> {
        let mut response = self
            .db
            .client
            .query("SELECT * FROM kg_relationships WHERE kg_id = $kg_id")
            .bind(("kg_id", kg_id.to_string()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Hydrates the full per-table context (columns + incident relationships) needed by
    /// the schema-selector / sql-generator agents for a final table set.
    #[instrument(level = "trace", skip(self))]
    pub async fn load_table_contexts(
        &self,
        kg_id: &str,
        table_ids: &[String],
    ) -> Result<Vec<TableContext>, KgAgentError> {
        let all_tables = self.get_tables(kg_id).await?;
        let all_relationships = self.get_relationships(kg_id).await?;

        let mut contexts = Vec::with_capacity(table_ids.len());
        for id in table_ids {
            let Some(table) = all_tables.iter().find(|t| &t.id == id).cloned() else {
                continue;
            };
            let columns = self.get_columns(&table.id).await?;
            let relationships = all_relationships
                .iter()
                .filter(|r| &r.from_table_id == id || &r.to_table_id == id)
                .cloned()
                .collect();
            contexts.push(TableContext {
                table,
                columns,
                relationships,
            });
        }
        Ok(contexts)
    }
}

const MAX_ATTEMPTS: usize = 3;
const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF_MS: u64 = 800;

async fn batch_insert<T>(db: &SurrealDbClient, table: &str, items: &[T]) -> Result<(), KgAgentError>
where
    T: serde::Serialize + Clone,
{
    if items.is_empty() {
        return Ok(());
    }

    let query = format!(
        "BEGIN TRANSACTION; FOR $row IN $rows {{ CREATE type::thing('{table}', $row.id) CONTENT $row; }}; COMMIT TRANSACTION;"
    );

    let mut backoff_ms = INITIAL_BACKOFF_MS;
    for attempt in 0..MAX_ATTEMPTS {
        let result = db.client.query(query.clone()).bind(("rows", items.to_vec())).await;
        match result.and_then(|r| r.check()) {
            Ok(_) => return Ok(()),
            Err(err) if is_retryable_conflict(&err) && attempt + 1 < MAX_ATTEMPTS => {
                tracing::warn!(table, attempt = attempt + 1, "transient conflict inserting batch; retrying");
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(KgAgentError::InternalError(format!(
        "failed to batch insert into {table} after {MAX_ATTEMPTS} attempts"
    )))
}

fn is_retryable_conflict(error: &surrealdb::Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}
