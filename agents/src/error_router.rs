use common::error::KgAgentError;
use common::llm::{LlmCapability, LlmCapabilityExt, StructuredRequest};
use kg_store::TableContext;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::state::{AgentState, ErrorInfo, RouteTo};

const TERMINAL_SUB_CATEGORIES: &[&str] = &["permission_denied", "timeout"];

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    category: String,
    sub_category: String,
    is_schema_related: bool,
    is_sql_generation_related: bool,
    requires_table_reselection: bool,
    requires_sql_regeneration: bool,
    confidence: f64,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    route: String,
    #[allow(dead_code)]
    priority_action: String,
}

/// Classifies an execution failure and decides whether a retry should re-select the
/// schema, re-generate the SQL, or give up.
pub struct ErrorRouter<'a> {
    llm: &'a dyn LlmCapability,
}

impl<'a> ErrorRouter<'a> {
    pub fn new(llm: &'a dyn LlmCapability) -> Self {
        Self { llm }
    }

    #[instrument(level = "trace", skip_all)]
    pub async fn classify(
        &self,
        error_message: &str,
        sql: &str,
        table_contexts: &[TableContext],
    ) -> Result<ErrorInfo, KgAgentError> {
        let table_names: Vec<&str> = table_contexts.iter().map(|c| c.table.name.as_str()).collect();

        let request = StructuredRequest {
            schema_name: "error_classification",
            schema_description: "Classification of a SQL execution failure",
            schema: json!({
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": ["schema_error", "sql_syntax_error", "sql_logic_error", "execution_error", "system_error"]
                    },
                    "sub_category": {
                        "type": "string",
                        "enum": [
                            "column_not_found", "table_not_found", "join_error", "syntax_error",
                            "type_mismatch", "ambiguous_reference", "groupby_error", "aggregate_error",
                            "function_error", "permission_denied", "timeout", "other"
                        ]
                    },
                    "is_schema_related": {"type": "boolean"},
                    "is_sql_generation_related": {"type": "boolean"},
                    "requires_table_reselection": {"type": "boolean"},
                    "requires_sql_regeneration": {"type": "boolean"},
                    "confidence": {"type": "number"},
                    "reasoning": {"type": "string"}
                },
                "required": [
                    "category", "sub_category", "is_schema_related", "is_sql_generation_related",
                    "requires_table_reselection", "requires_sql_regeneration", "confidence", "reasoning"
                ],
                "additionalProperties": false
            }),
            system_prompt: "You classify a failed SQL execution against a known schema, to help a retry pipeline decide whether it needs a different table set or a different query.",
            user_prompt: format!(
                "Error: {error_message}\nSQL: {sql}\nTables available: {table_names:?}"
            ),
        };

        let response: ClassificationResponse = self.llm.complete_structured(request).await?;
        Ok(ErrorInfo {
            message: error_message.to_string(),
            category: response.category,
            sub_category: response.sub_category,
            is_schema_related: response.is_schema_related,
            is_sql_generation_related: response.is_sql_generation_related,
            requires_table_reselection: response.requires_table_reselection,
            requires_sql_regeneration: response.requires_sql_regeneration,
            confidence: response.confidence,
            reasoning: response.reasoning,
        })
    }

    #[instrument(level = "trace", skip_all)]
    pub async fn route(&self, classification: &ErrorInfo, state: &AgentState) -> RouteTo {
        if state.retry_count >= state.max_retries
            || TERMINAL_SUB_CATEGORIES.contains(&classification.sub_category.as_str())
        {
            return RouteTo::Complete;
        }

        match self.route_llm(classification, state).await {
            Ok(route) => route,
            Err(err) => {
                warn!(error = %err, "error router routing call failed; falling back to heuristic");
                if classification.is_schema_related {
                    RouteTo::SchemaSelector
                } else {
                    RouteTo::SqlGenerator
                }
            }
        }
    }

    async fn route_llm(&self, classification: &ErrorInfo, state: &AgentState) -> Result<RouteTo, KgAgentError> {
        let history: Vec<&str> = state.error_history.iter().map(|e| e.category.as_str()).collect();

        let request = StructuredRequest {
            schema_name: "error_routing",
            schema_description: "Which upstream agent should retry after a classified failure",
            schema: json!({
                "type": "object",
                "properties": {
                    "route": {"type": "string", "enum": ["agent_1", "agent_2"]},
                    "priority_action": {"type": "string"}
                },
                "required": ["route", "priority_action"],
                "additionalProperties": false
            }),
            system_prompt: "You decide whether a failed query retry should go back to table re-selection (agent_1) or SQL re-generation (agent_2). Prefer routing to the agent that was not already tried for this same error category, to avoid thrashing between the same two fixes.",
            user_prompt: format!(
                "Category: {}\nSub-category: {}\nReasoning: {}\nSchema related: {}\nSql generation related: {}\nError category history this run: {:?}",
                classification.category,
                classification.sub_category,
                classification.reasoning,
                classification.is_schema_related,
                classification.is_sql_generation_related,
                history
            ),
        };

        let response: RouteResponse = self.llm.complete_structured(request).await?;
        info!(route = %response.route, "error router decided");
        Ok(match response.route.as_str() {
            "agent_1" => RouteTo::SchemaSelector,
            _ => RouteTo::SqlGenerator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_sub_categories_contains_timeout_and_permission() {
        assert!(TERMINAL_SUB_CATEGORIES.contains(&"timeout"));
        assert!(TERMINAL_SUB_CATEGORIES.contains(&"permission_denied"));
        assert!(!TERMINAL_SUB_CATEGORIES.contains(&"column_not_found"));
    }
}
