use common::error::KgAgentError;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

#[derive(Debug, Clone)]
pub struct ExtractedTable {
    pub name: String,
    pub schema_namespace: String,
    pub qualified_name: String,
    pub row_count_estimate: Option<i64>,
}

/// Enumerates base tables in the namespace and attaches a row-count estimate from the
/// catalog's planner statistics, falling back to an exact count only when the estimate
/// is unavailable.
#[instrument(level = "trace", skip(pool))]
pub async fn extract_tables(
    pool: &PgPool,
    schema_namespace: &str,
) -> Result<Vec<ExtractedTable>, KgAgentError> {
    let rows = sqlx::query(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
         ORDER BY table_name",
    )
    .bind(schema_namespace)
    .fetch_all(pool)
    .await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("table_name")?;
        let qualified_name = format!("{schema_namespace}.{name}");
        let row_count_estimate = estimate_row_count(pool, &qualified_name).await;
        tables.push(ExtractedTable {
            name,
            schema_namespace: schema_namespace.to_string(),
            qualified_name,
            row_count_estimate,
        });
    }

    Ok(tables)
}

async fn estimate_row_count(pool: &PgPool, qualified_name: &str) -> Option<i64> {
    match planner_row_estimate(pool, qualified_name).await {
        Ok(Some(estimate)) if estimate >= 0 => Some(estimate),
        _ => exact_row_count(pool, qualified_name).await.ok(),
    }
}

async fn planner_row_estimate(pool: &PgPool, qualified_name: &str) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query("SELECT pg_class.reltuples::bigint AS estimate FROM pg_class WHERE oid = $1::regclass")
        .bind(qualified_name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.try_get::<i64, _>("estimate")).transpose()?)
}

async fn exact_row_count(pool: &PgPool, qualified_name: &str) -> Result<i64, sqlx::Error> {
    let query = format!("SELECT COUNT(*) AS exact_count FROM {qualified_name}");
    match sqlx::query(&query).fetch_one(pool).await {
        Ok(row) => row.try_get::<i64, _>("exact_count"),
        Err(err) => {
            warn!(table = qualified_name, error = %err, "exact row count fallback failed");
            Err(err)
        }
    }
}
