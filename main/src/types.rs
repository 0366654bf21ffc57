use std::collections::HashMap;

use agents::{ErrorInfo, ExecutionResult};
use common::storage::types::knowledge_graph::KgStatus;
use serde::{Deserialize, Serialize};

/// Knobs for `Engine::connect_or_build_kg`; enrichment and embedding are each skippable
/// since they cost LLM calls proportional to schema size.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectOrBuildKgRequest {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub generate_descriptions: bool,
    #[serde(default = "default_true")]
    pub generate_embeddings: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct KgLoadResult {
    pub kg_id: String,
    pub status: KgStatus,
    pub version: u32,
    pub table_count: usize,
    pub was_freshly_built: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KgListItem {
    pub kg_id: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub status: KgStatus,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueryMetadata {
    pub tables_selected: Vec<String>,
    pub iterations: u32,
    pub error_history: Vec<ErrorInfo>,
    pub timing_ms: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub confidence: Option<f64>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub error_category: Option<String>,
    pub needs_clarification: bool,
    pub clarification_request: Option<String>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResult {
    pub success: bool,
    pub lesson_recorded: bool,
}
