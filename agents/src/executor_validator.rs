use std::time::{Duration, Instant};

use common::error::KgAgentError;
use common::llm::LlmCapability;
use common::storage::types::query_log::QueryLog;
use error_summary::ErrorSummaryManager;
use query_memory::QueryMemory;
use serde_json::{json, Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column as _, PgPool, Row};
use state_machines::state_machine;
use tracing::{info, instrument, warn};

use crate::error_router::ErrorRouter;
use crate::state::{AgentState, ExecutionResult, RouteTo};

state_machine! {
    name: ExecutorValidatorMachine,
    state: ExecutorValidatorState,
    initial: Ready,
    states: [Ready, Prepared, Executed, Classified, Failed],
    events {
        prepare { transition: { from: Ready, to: Prepared } }
        execute { transition: { from: Prepared, to: Executed } }
        classify { transition: { from: Executed, to: Classified } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Prepared, to: Failed }
            transition: { from: Executed, to: Failed }
        }
    }
}

fn map_guard_error(event: &str, guard: &state_machines::core::GuardError) -> KgAgentError {
    KgAgentError::InternalError(format!("invalid executor-validator transition during {event}: {guard:?}"))
}

const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);
const ROW_LIMIT_CAP: u32 = 10_000;
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Runs the generated SQL against the target database inside a safety envelope,
/// persists the outcome, and on failure hands the error to the router to decide
/// where the retry should go next.
pub struct ExecutorValidator<'a> {
    target_pool: &'a PgPool,
    query_memory: &'a QueryMemory,
    error_router: &'a ErrorRouter<'a>,
    error_summary: &'a ErrorSummaryManager,
    llm: &'a dyn LlmCapability,
}

impl<'a> ExecutorValidator<'a> {
    pub fn new(
        target_pool: &'a PgPool,
        query_memory: &'a QueryMemory,
        error_router: &'a ErrorRouter<'a>,
        error_summary: &'a ErrorSummaryManager,
        llm: &'a dyn LlmCapability,
    ) -> Self {
        Self {
            target_pool,
            query_memory,
            error_router,
            error_summary,
            llm,
        }
    }

    #[instrument(level = "trace", skip_all, fields(kg_id = %state.kg_id))]
    pub async fn run(&self, state: &mut AgentState) -> Result<(), KgAgentError> {
        let machine = ExecutorValidatorMachine::new(());

        let Some(sql) = state.generated_sql.clone() else {
            return Err(KgAgentError::InternalError("executor invoked with no generated sql".into()));
        };
        let safe_sql = prepare(&sql);
        let machine = machine.prepare().map_err(|(_, g)| map_guard_error("prepare", &g))?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(STATEMENT_TIMEOUT, sqlx::query(&safe_sql).fetch_all(self.target_pool)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let rows = match outcome {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                return self.handle_failure(state, &safe_sql, err.to_string(), elapsed_ms).await;
            }
            Err(_) => {
                return self
                    .handle_failure(state, &safe_sql, "statement timed out after 30s".to_string(), elapsed_ms)
                    .await;
            }
        };

        let _machine = machine.execute().map_err(|(_, g)| map_guard_error("execute", &g))?;

        let result = rows_to_result(&rows, elapsed_ms);
        info!(kg_id = %state.kg_id, rows = result.row_count, elapsed_ms, "query executed");

        let mut log = QueryLog::new(state.kg_id.clone(), state.user_query.clone());
        log.refined_question = state.refined_query.clone();
        log.selected_tables = state.selected_tables.clone();
        log.generated_sql = Some(safe_sql);
        log.success = true;
        log.execution_time_ms = Some(elapsed_ms);
        log.tables_used = state.final_tables.clone();
        log.iterations = state.retry_count + 1;
        log.confidence = state.confidence;
        log.query_embedding = state.query_embedding.clone();
        self.query_memory.insert(log).await?;

        state.execution_result = Some(result);
        state.error_info = None;
        state.route_to = RouteTo::Complete;
        Ok(())
    }

    async fn handle_failure(
        &self,
        state: &mut AgentState,
        safe_sql: &str,
        error_message: String,
        elapsed_ms: u64,
    ) -> Result<(), KgAgentError> {
        warn!(kg_id = %state.kg_id, error = %error_message, "query execution failed");

        let truncated: String = error_message.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        let classification = self
            .error_router
            .classify(&truncated, safe_sql, &state.table_contexts)
            .await?;

        let route = self.error_router.route(&classification, state).await;
        state.error_history.push(classification.clone());
        state.error_info = Some(classification.clone());
        state.route_to = route;

        let fix_applied = match route {
            RouteTo::SchemaSelector => Some("re-selected tables"),
            RouteTo::SqlGenerator => Some("regenerated sql"),
            RouteTo::Complete | RouteTo::ExecutorValidator => None,
        };

        if let Err(err) = self
            .error_summary
            .append_from_error(
                &state.kg_id,
                &truncated,
                &classification.category,
                fix_applied,
                &state.final_tables,
                safe_sql,
                self.llm,
            )
            .await
        {
            warn!(kg_id = %state.kg_id, error = %err, "failed to append error lesson");
        }

        if route == RouteTo::Complete {
            let mut log = QueryLog::new(state.kg_id.clone(), state.user_query.clone());
            log.refined_question = state.refined_query.clone();
            log.selected_tables = state.selected_tables.clone();
            log.generated_sql = Some(safe_sql.to_string());
            log.success = false;
            log.execution_time_ms = Some(elapsed_ms);
            log.error_message = Some(truncated.clone());
            log.error_category = Some(classification.category.clone());
            log.tables_used = state.final_tables.clone();
            log.iterations = state.retry_count + 1;
            log.query_embedding = state.query_embedding.clone();
            self.query_memory.insert(log).await?;
            return Ok(());
        }

        state.retry_count += 1;
        self.query_memory
            .record_error_pattern(
                &state.kg_id,
                &classification.category,
                classification.reasoning.clone(),
                Some(truncated),
                fix_applied.map(str::to_string),
                state.final_tables.clone(),
            )
            .await?;
        Ok(())
    }
}

/// Strips a trailing semicolon and adds a hard row cap when the query carries no
/// row-limiting clause of its own, so a runaway SELECT can't exhaust the connection.
fn prepare(sql: &str) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.contains("LIMIT") {
        trimmed.to_string()
    } else {
        format!("{trimmed} LIMIT {ROW_LIMIT_CAP}")
    }
}

fn rows_to_result(rows: &[PgRow], elapsed_ms: u64) -> ExecutionResult {
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let values: Vec<Value> = rows.iter().map(row_to_json).collect();
    ExecutionResult {
        row_count: values.len(),
        columns,
        rows: values,
        execution_time_ms: elapsed_ms,
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut map = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), decode_cell(row, i));
    }
    Value::Object(map)
}

/// Generic column decoding for arbitrary, unpredictable result shapes: tries the common
/// Postgres scalar types in order and falls back to null rather than failing the row.
fn decode_cell(row: &PgRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
        return v.map_or(Value::Null, |v| json!(v.to_rfc3339()));
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
        return v.map_or(Value::Null, |v| json!(v.to_string()));
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_strips_semicolon_and_adds_limit() {
        let sql = prepare("SELECT * FROM orders;");
        assert_eq!(sql, "SELECT * FROM orders LIMIT 10000");
    }

    #[test]
    fn prepare_respects_existing_limit() {
        let sql = prepare("SELECT * FROM orders LIMIT 5");
        assert_eq!(sql, "SELECT * FROM orders LIMIT 5");
    }

    #[test]
    fn prepare_is_case_insensitive_for_limit_detection() {
        let sql = prepare("select * from orders limit 5");
        assert_eq!(sql, "select * from orders limit 5");
    }
}
