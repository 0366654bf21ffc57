use std::collections::HashMap;

use kg_store::TableContext;
use serde::{Deserialize, Serialize};

/// Where the workflow driver should send control next after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTo {
    SchemaSelector,
    SqlGenerator,
    ExecutorValidator,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// Error-router classification of one execution failure, retained in `error_history`
/// so later routing decisions can see whether the same category keeps repeating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub category: String,
    pub sub_category: String,
    pub is_schema_related: bool,
    pub is_sql_generation_related: bool,
    pub requires_table_reselection: bool,
    pub requires_sql_regeneration: bool,
    pub confidence: f64,
    pub reasoning: String,
}

/// Carries everything the three agents and the error router read and write across one
/// query-processing run. Owned by the workflow driver; reread at each agent entry.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub kg_id: String,
    pub user_query: String,
    pub refined_query: Option<String>,
    pub clarifications_provided: Vec<String>,

    pub query_embedding: Option<Vec<f32>>,
    pub candidate_tables: Vec<String>,
    pub selected_tables: Vec<String>,
    pub bridging_tables: Vec<String>,
    pub enrichment_tables: Vec<String>,
    pub final_tables: Vec<String>,
    pub table_contexts: Vec<TableContext>,
    pub schema_selection_confidence: Option<f64>,

    pub generated_sql: Option<String>,
    pub explanation: Option<String>,
    pub confidence: Option<f64>,

    pub execution_result: Option<ExecutionResult>,
    pub error_info: Option<ErrorInfo>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub error_history: Vec<ErrorInfo>,
    pub route_to: RouteTo,

    /// Read once at run start (per the spec's resolution of the cross-run ordering
    /// open question) rather than re-read at every agent boundary.
    pub schema_lessons: String,
    pub sql_lessons: String,

    pub timing_ms: HashMap<String, u64>,
}

impl AgentState {
    pub fn new(kg_id: String, user_query: String, schema_lessons: String, sql_lessons: String) -> Self {
        Self {
            kg_id,
            user_query,
            refined_query: None,
            clarifications_provided: Vec::new(),
            query_embedding: None,
            candidate_tables: Vec::new(),
            selected_tables: Vec::new(),
            bridging_tables: Vec::new(),
            enrichment_tables: Vec::new(),
            final_tables: Vec::new(),
            table_contexts: Vec::new(),
            schema_selection_confidence: None,
            generated_sql: None,
            explanation: None,
            confidence: None,
            execution_result: None,
            error_info: None,
            retry_count: 0,
            max_retries: 3,
            error_history: Vec::new(),
            route_to: RouteTo::SchemaSelector,
            schema_lessons,
            sql_lessons,
            timing_ms: HashMap::new(),
        }
    }

    pub fn effective_query(&self) -> &str {
        self.refined_query.as_deref().unwrap_or(&self.user_query)
    }

    pub fn record_timing(&mut self, stage: &str, millis: u64) {
        self.timing_ms.insert(stage.to_string(), millis);
    }
}
