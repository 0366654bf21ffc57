use common::error::KgAgentError;
use sqlx::{PgPool, Row};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipType {
    OneToOne,
    ManyToOne,
}

#[derive(Debug, Clone)]
pub struct ExtractedRelationship {
    pub from_table: String,
    pub to_table: String,
    pub from_column: String,
    pub to_column: String,
    pub relationship_type: RelationshipType,
    pub join_condition: String,
    pub is_self_reference: bool,
    pub constraint_name: String,
}

/// Extracts one relationship per foreign key, directed from the referring table/column
/// to the referenced table/column.
#[instrument(level = "trace", skip(pool))]
pub async fn extract_relationships(
    pool: &PgPool,
    schema_namespace: &str,
) -> Result<Vec<ExtractedRelationship>, KgAgentError> {
    let rows = sqlx::query(
        "SELECT tc.constraint_name, tc.table_name AS from_table, kcu.column_name AS from_column, \
                ccu.table_name AS to_table, ccu.column_name AS to_column \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
           ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema \
         WHERE tc.table_schema = $1 AND tc.constraint_type = 'FOREIGN KEY'",
    )
    .bind(schema_namespace)
    .fetch_all(pool)
    .await?;

    let mut relationships = Vec::with_capacity(rows.len());
    for row in rows {
        let constraint_name: String = row.try_get("constraint_name")?;
        let from_table: String = row.try_get("from_table")?;
        let from_column: String = row.try_get("from_column")?;
        let to_table: String = row.try_get("to_table")?;
        let to_column: String = row.try_get("to_column")?;

        let relationship_type =
            determine_relationship_type(pool, schema_namespace, &from_table, &from_column).await?;

        let join_condition = format!(
            "{from_table}.{from_column} = {to_table}.{to_column}",
        );
        let is_self_reference = from_table == to_table;

        relationships.push(ExtractedRelationship {
            from_table,
            to_table,
            from_column,
            to_column,
            relationship_type,
            join_condition,
            is_self_reference,
            constraint_name,
        });
    }

    Ok(relationships)
}

/// One-to-one iff the referring column itself carries a PRIMARY KEY or UNIQUE constraint;
/// otherwise it's the usual many-to-one direction of a foreign key.
async fn determine_relationship_type(
    pool: &PgPool,
    schema_namespace: &str,
    table_name: &str,
    column_name: &str,
) -> Result<RelationshipType, KgAgentError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS hits \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         WHERE tc.table_schema = $1 AND tc.table_name = $2 AND kcu.column_name = $3 \
           AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE')",
    )
    .bind(schema_namespace)
    .bind(table_name)
    .bind(column_name)
    .fetch_one(pool)
    .await?;

    let hits: i64 = row.try_get("hits")?;
    Ok(if hits > 0 {
        RelationshipType::OneToOne
    } else {
        RelationshipType::ManyToOne
    })
}
