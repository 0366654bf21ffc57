use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{error::KgAgentError, storage::db::SurrealDbClient};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
    options: &'static str,
}

const fn hnsw_index_specs() -> [HnswIndexSpec; 2] {
    [
        HnswIndexSpec {
            index_name: "idx_kg_embeddings_vector",
            table: "kg_embeddings",
            field: "vector",
            options: "DIST COSINE TYPE F32 EFC 150 M 12 CONCURRENTLY",
        },
        HnswIndexSpec {
            index_name: "idx_kg_query_log_embedding",
            table: "kg_query_log",
            field: "query_embedding",
            options: "DIST COSINE TYPE F32 EFC 150 M 12 CONCURRENTLY",
        },
    ]
}

impl HnswIndexSpec {
    fn definition_if_not_exists(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS {field} HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            field = self.field,
            dimension = dimension,
            options = self.options,
        )
    }

    fn definition_overwrite(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} \
             FIELDS {field} HNSW DIMENSION {dimension} {options};",
            index = self.index_name,
            table = self.table,
            field = self.field,
            dimension = dimension,
            options = self.options,
        )
    }
}

enum HnswIndexState {
    Missing,
    Matches,
    Different(u64),
}

/// Build the runtime HNSW vector indexes, using polled, concurrent creation.
/// Idempotent: safe to call repeatedly; overwrites a stale definition when the
/// configured embedding dimension changes.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), KgAgentError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| KgAgentError::InternalError(err.to_string()))
}

pub async fn rebuild_indexes(db: &SurrealDbClient) -> Result<(), KgAgentError> {
    rebuild_indexes_inner(db)
        .await
        .map_err(|err| KgAgentError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(db: &SurrealDbClient, embedding_dimension: usize) -> Result<()> {
    let tasks = hnsw_index_specs().into_iter().map(|spec| async move {
        match hnsw_index_state(db, &spec, embedding_dimension).await? {
            HnswIndexState::Missing => {
                create_index_with_polling(
                    db,
                    spec.definition_if_not_exists(embedding_dimension),
                    spec.index_name,
                    spec.table,
                )
                .await
            }
            HnswIndexState::Matches => {
                let status = get_index_status(db, spec.index_name, spec.table).await?;
                if status.eq_ignore_ascii_case("error") {
                    warn!(
                        index = spec.index_name,
                        table = spec.table,
                        "HNSW index found in error state; triggering rebuild"
                    );
                    create_index_with_polling(
                        db,
                        spec.definition_overwrite(embedding_dimension),
                        spec.index_name,
                        spec.table,
                    )
                    .await
                } else {
                    Ok(())
                }
            }
            HnswIndexState::Different(existing) => {
                info!(
                    index = spec.index_name,
                    table = spec.table,
                    existing_dimension = existing,
                    target_dimension = embedding_dimension,
                    "overwriting HNSW index to match new embedding dimension"
                );
                create_index_with_polling(
                    db,
                    spec.definition_overwrite(embedding_dimension),
                    spec.index_name,
                    spec.table,
                )
                .await
            }
        }
    });

    try_join_all(tasks).await.map(|_| ())
}

async fn rebuild_indexes_inner(db: &SurrealDbClient) -> Result<()> {
    debug!("rebuilding HNSW indexes");
    let tasks = hnsw_index_specs().into_iter().map(|spec| async move {
        if !index_exists(db, spec.table, spec.index_name).await? {
            debug!(index = spec.index_name, "skipping rebuild, index missing");
            return Ok(());
        }
        let Some(dimension) = existing_hnsw_dimension(db, &spec).await? else {
            warn!(index = spec.index_name, "index missing dimension; skipping rebuild");
            return Ok(());
        };
        create_index_with_polling(
            db,
            spec.definition_overwrite(dimension),
            spec.index_name,
            spec.table,
        )
        .await
    });

    try_join_all(tasks).await.map(|_| ())
}

async fn hnsw_index_state(
    db: &SurrealDbClient,
    spec: &HnswIndexSpec,
    expected_dimension: usize,
) -> Result<HnswIndexState> {
    match existing_hnsw_dimension(db, spec).await? {
        None => Ok(HnswIndexState::Missing),
        Some(current) if current == expected_dimension => Ok(HnswIndexState::Matches),
        Some(current) => Ok(HnswIndexState::Different(current as u64)),
    }
}

async fn existing_hnsw_dimension(db: &SurrealDbClient, spec: &HnswIndexSpec) -> Result<Option<usize>> {
    let Some(indexes) = table_index_definitions(db, spec.table).await? else {
        return Ok(None);
    };

    let Some(definition) = indexes
        .get(spec.index_name)
        .and_then(|details| details.get("Strand"))
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };

    Ok(extract_dimension(definition).and_then(|d| usize::try_from(d).ok()))
}

fn extract_dimension(definition: &str) -> Option<u64> {
    definition
        .split("DIMENSION")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.trim_end_matches(';').parse::<u64>().ok())
}

async fn get_index_status(db: &SurrealDbClient, index_name: &str, table: &str) -> Result<String> {
    let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
    let mut info_res = db
        .client
        .query(info_query)
        .await
        .context("checking index status")?;
    let info: Option<Value> = info_res.take(0).context("failed to take info result")?;

    let Some(info) = info else {
        return Ok("unknown".to_string());
    };

    let status = info
        .get("building")
        .and_then(|b| b.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("ready")
        .to_string();

    Ok(status)
}

async fn create_index_with_polling(
    db: &SurrealDbClient,
    definition: String,
    index_name: &str,
    table: &str,
) -> Result<()> {
    let expected_total = count_table_rows(db, table)
        .await
        .with_context(|| format!("counting rows in {table} for index {index_name} progress"))?;

    let mut attempts = 0;
    const MAX_ATTEMPTS: usize = 3;
    loop {
        attempts += 1;
        let res = db
            .client
            .query(definition.clone())
            .await
            .with_context(|| format!("creating index {index_name} on table {table}"))?;
        match res.check() {
            Ok(_) => break,
            Err(err) => {
                let conflict = err.to_string().contains("read or write conflict");
                warn!(index = %index_name, table = %table, error = ?err, attempt = attempts, "index definition failed");
                if conflict && attempts < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                return Err(err)
                    .with_context(|| format!("index definition failed for {index_name} on {table}"));
            }
        }
    }

    poll_index_build_status(db, index_name, table, Some(expected_total), INDEX_POLL_INTERVAL).await
}

async fn poll_index_build_status(
    db: &SurrealDbClient,
    index_name: &str,
    table: &str,
    total_rows: Option<u64>,
    poll_every: Duration,
) -> Result<()> {
    loop {
        tokio::time::sleep(poll_every).await;

        let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
        let mut info_res = db
            .client
            .query(info_query)
            .await
            .with_context(|| format!("checking index build status for {index_name} on {table}"))?;
        let info: Option<Value> = info_res
            .take(0)
            .context("failed to deserialize INFO FOR INDEX result")?;

        let Some(snapshot) = parse_index_build_info(info, total_rows) else {
            warn!(index = %index_name, table = %table, "INFO FOR INDEX returned no data");
            break;
        };

        if snapshot.is_ready() || snapshot.status.eq_ignore_ascii_case("error") {
            debug!(index = %index_name, status = snapshot.status, "index build finished polling");
            break;
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct IndexBuildSnapshot {
    status: String,
    initial: u64,
    updated: u64,
}

impl IndexBuildSnapshot {
    fn is_ready(&self) -> bool {
        self.status.eq_ignore_ascii_case("ready")
    }
}

fn parse_index_build_info(info: Option<Value>, _total_rows: Option<u64>) -> Option<IndexBuildSnapshot> {
    let info = info?;
    let building = info.get("building");

    let status = building
        .and_then(|b| b.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("ready")
        .to_string();

    let initial = building
        .and_then(|b| b.get("initial"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let updated = building
        .and_then(|b| b.get("updated"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Some(IndexBuildSnapshot {
        status,
        initial,
        updated,
    })
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

async fn count_table_rows(db: &SurrealDbClient, table: &str) -> Result<u64> {
    let query = format!("SELECT count() AS count FROM {table} GROUP ALL;");
    let mut response = db
        .client
        .query(query)
        .await
        .with_context(|| format!("counting rows in {table}"))?;
    let rows: Vec<CountRow> = response
        .take(0)
        .context("failed to deserialize count() response")?;
    Ok(rows.first().map_or(0, |r| r.count))
}

async fn table_index_definitions(db: &SurrealDbClient, table: &str) -> Result<Option<Map<String, Value>>> {
    let info_query = format!("INFO FOR TABLE {table};");
    let mut response = db
        .client
        .query(info_query)
        .await
        .with_context(|| format!("fetching table info for {table}"))?;

    let info: surrealdb::Value = response.take(0).context("failed to take table info response")?;
    let info_json: Value = serde_json::to_value(info).context("serializing table info to JSON")?;

    Ok(info_json
        .get("Object")
        .and_then(|o| o.get("indexes"))
        .and_then(|i| i.get("Object"))
        .and_then(|i| i.as_object())
        .cloned())
}

async fn index_exists(db: &SurrealDbClient, table: &str, index_name: &str) -> Result<bool> {
    let Some(indexes) = table_index_definitions(db, table).await? else {
        return Ok(false);
    };
    Ok(indexes.contains_key(index_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn extract_dimension_parses_value() {
        let definition = "DEFINE INDEX idx ON TABLE t FIELDS vector HNSW DIMENSION 1536 DIST COSINE TYPE F32;";
        assert_eq!(extract_dimension(definition), Some(1536));
    }

    #[test]
    fn parse_index_build_info_defaults_to_ready_without_building_block() {
        let snapshot = parse_index_build_info(Some(json!({})), Some(10)).expect("snapshot");
        assert!(snapshot.is_ready());
    }

    #[tokio::test]
    async fn ensure_runtime_indexes_is_idempotent() {
        let namespace = "indexes_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        ensure_runtime_indexes(&db, 1536).await.expect("initial index creation");
        ensure_runtime_indexes(&db, 1536).await.expect("second index creation");
    }

    #[tokio::test]
    async fn ensure_hnsw_index_overwrites_dimension() {
        let namespace = "indexes_dim";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        ensure_runtime_indexes(&db, 1536).await.expect("initial index creation");
        ensure_runtime_indexes(&db, 128).await.expect("overwritten index creation");
    }
}
