use common::error::KgAgentError;
use common::llm::LlmCapability;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use crate::pii;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cardinality {
    Low,
    Medium,
    High,
}

impl Cardinality {
    fn classify(unique_count: i64, total_count: i64) -> Self {
        if unique_count < 10 {
            Cardinality::Low
        } else if total_count > 0 && (unique_count as f64) < 0.5 * (total_count as f64) {
            Cardinality::Medium
        } else {
            Cardinality::High
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedColumn {
    pub table_name: String,
    pub name: String,
    pub qualified_name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_pk: bool,
    pub is_unique: bool,
    pub is_fk: bool,
    pub position: i32,
    pub sample_values: Vec<String>,
    pub enum_values: Vec<String>,
    pub cardinality: Option<Cardinality>,
    pub null_pct: Option<f64>,
    pub is_pii: bool,
}

#[instrument(level = "trace", skip(pool, llm))]
pub async fn extract_columns(
    pool: &PgPool,
    schema_namespace: &str,
    table_name: &str,
    llm: Option<&dyn LlmCapability>,
) -> Result<Vec<ExtractedColumn>, KgAgentError> {
    let rows = sqlx::query(
        "SELECT column_name, data_type, is_nullable, ordinal_position \
         FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 \
         ORDER BY ordinal_position",
    )
    .bind(schema_namespace)
    .bind(table_name)
    .fetch_all(pool)
    .await?;

    let pk_columns = constrained_columns(pool, schema_namespace, table_name, "PRIMARY KEY").await?;
    let unique_columns = constrained_columns(pool, schema_namespace, table_name, "UNIQUE").await?;
    let fk_columns = constrained_columns(pool, schema_namespace, table_name, "FOREIGN KEY").await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        let position: i32 = row.try_get("ordinal_position")?;

        let is_pk = pk_columns.contains(&name);
        let is_unique = unique_columns.contains(&name);
        let is_fk = fk_columns.contains(&name);

        let qualified_name = format!("{table_name}.{name}");

        let stats = column_statistics(pool, schema_namespace, table_name, &name).await;
        let (cardinality, null_pct, sample_values, enum_values) = match stats {
            Ok(stats) => {
                let cardinality = Cardinality::classify(stats.unique_count, stats.total_count);
                let null_pct = if stats.total_count > 0 {
                    Some(
                        1.0 - (stats.non_null_count as f64 / stats.total_count as f64),
                    )
                } else {
                    None
                };
                let sample_values_list = sample_values(pool, schema_namespace, table_name, &name, 5)
                    .await
                    .unwrap_or_default();
                let enum_values = if cardinality == Cardinality::Low {
                    sample_values(pool, schema_namespace, table_name, &name, 20)
                        .await
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                (Some(cardinality), null_pct, sample_values_list, enum_values)
            }
            Err(err) => {
                warn!(column = %qualified_name, error = %err, "column statistics unavailable");
                (None, None, Vec::new(), Vec::new())
            }
        };

        let is_pii = pii::detect(&name, &data_type, &sample_values, llm).await;

        columns.push(ExtractedColumn {
            table_name: table_name.to_string(),
            name,
            qualified_name,
            data_type,
            nullable: is_nullable.eq_ignore_ascii_case("YES"),
            is_pk,
            is_unique,
            is_fk,
            position,
            sample_values,
            enum_values,
            cardinality,
            null_pct,
            is_pii,
        });
    }

    Ok(columns)
}

async fn constrained_columns(
    pool: &PgPool,
    schema_namespace: &str,
    table_name: &str,
    constraint_type: &str,
) -> Result<Vec<String>, KgAgentError> {
    let rows = sqlx::query(
        "SELECT kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         WHERE tc.table_schema = $1 AND tc.table_name = $2 AND tc.constraint_type = $3",
    )
    .bind(schema_namespace)
    .bind(table_name)
    .bind(constraint_type)
    .fetch_all(pool)
    .await?;

    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        names.push(row.try_get::<String, _>("column_name")?);
    }
    Ok(names)
}

struct ColumnStats {
    unique_count: i64,
    total_count: i64,
    non_null_count: i64,
}

async fn column_statistics(
    pool: &PgPool,
    schema_namespace: &str,
    table_name: &str,
    column_name: &str,
) -> Result<ColumnStats, sqlx::Error> {
    let qualified = format!("{schema_namespace}.{table_name}");
    let query = format!(
        "SELECT COUNT(DISTINCT \"{column_name}\") AS unique_count, \
                COUNT(*) AS total_count, \
                COUNT(\"{column_name}\") AS non_null_count \
         FROM {qualified}"
    );
    let row = sqlx::query(&query).fetch_one(pool).await?;
    Ok(ColumnStats {
        unique_count: row.try_get("unique_count")?,
        total_count: row.try_get("total_count")?,
        non_null_count: row.try_get("non_null_count")?,
    })
}

async fn sample_values(
    pool: &PgPool,
    schema_namespace: &str,
    table_name: &str,
    column_name: &str,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let qualified = format!("{schema_namespace}.{table_name}");
    let query = format!(
        "SELECT DISTINCT \"{column_name}\"::text AS value FROM {qualified} \
         WHERE \"{column_name}\" IS NOT NULL LIMIT {limit}"
    );
    let rows = sqlx::query(&query).fetch_all(pool).await?;
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        if let Ok(value) = row.try_get::<String, _>("value") {
            values.push(value);
        }
    }
    Ok(values)
}
