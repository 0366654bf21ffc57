pub mod columns;
pub mod pii;
pub mod relationships;
pub mod tables;

use common::error::KgAgentError;
use common::llm::LlmCapability;
use sqlx::PgPool;
use tracing::instrument;

pub use columns::ExtractedColumn;
pub use relationships::ExtractedRelationship;
pub use tables::ExtractedTable;

#[derive(Debug, Clone, Default)]
pub struct ExtractedSchema {
    pub tables: Vec<ExtractedTable>,
    pub columns: Vec<ExtractedColumn>,
    pub relationships: Vec<ExtractedRelationship>,
}

/// Extracts the full structural + statistical picture of one schema namespace from a
/// running Postgres-compatible database. Per-column statistics are best-effort: a
/// failure there is logged and leaves the field unset rather than aborting the whole
/// extraction. A connection failure is fatal and propagates.
#[instrument(level = "trace", skip(pool, llm))]
pub async fn extract_schema(
    pool: &PgPool,
    schema_namespace: &str,
    llm: Option<&dyn LlmCapability>,
) -> Result<ExtractedSchema, KgAgentError> {
    let extracted_tables = tables::extract_tables(pool, schema_namespace).await?;

    let mut columns = Vec::new();
    for table in &extracted_tables {
        let table_columns = columns::extract_columns(pool, schema_namespace, &table.name, llm).await?;
        columns.extend(table_columns);
    }

    let relationships = relationships::extract_relationships(pool, schema_namespace).await?;

    Ok(ExtractedSchema {
        tables: extracted_tables,
        columns,
        relationships,
    })
}
