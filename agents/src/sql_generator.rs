use common::error::KgAgentError;
use common::llm::{LlmCapability, LlmCapabilityExt, StructuredRequest};
use kg_store::TableContext;
use query_memory::QueryMemory;
use serde::Deserialize;
use serde_json::json;
use state_machines::state_machine;
use tracing::{info, instrument, warn};

use crate::state::AgentState;

state_machine! {
    name: SqlGeneratorMachine,
    state: SqlGeneratorState,
    initial: Ready,
    states: [Ready, SchemaBuilt, Drafted, Validated, Failed],
    events {
        build_schema { transition: { from: Ready, to: SchemaBuilt } }
        draft { transition: { from: SchemaBuilt, to: Drafted } }
        validate { transition: { from: Drafted, to: Validated } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: SchemaBuilt, to: Failed }
            transition: { from: Drafted, to: Failed }
        }
    }
}

fn map_guard_error(event: &str, guard: &state_machines::core::GuardError) -> KgAgentError {
    KgAgentError::InternalError(format!("invalid sql-generator transition during {event}: {guard:?}"))
}

const EXAMPLE_COUNT: usize = 5;

#[derive(Debug, Deserialize)]
struct SqlDraft {
    #[allow(dead_code)]
    reasoning: String,
    sql: String,
    explanation: String,
    confidence: f64,
}

/// A single local-validation problem found in a drafted query, without a DB round trip.
#[derive(Debug)]
struct ValidationIssue(String);

/// Produces SQL from the final table set, retrieved similar past queries, and learned
/// lessons, then validates it locally and gives itself one self-correction turn before
/// handing an unresolved failure to the executor-validator for classification.
pub struct SqlGenerator<'a> {
    llm: &'a dyn LlmCapability,
    query_memory: &'a QueryMemory,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(llm: &'a dyn LlmCapability, query_memory: &'a QueryMemory) -> Self {
        Self { llm, query_memory }
    }

    #[instrument(level = "trace", skip_all, fields(kg_id = %state.kg_id))]
    pub async fn run(&self, state: &mut AgentState) -> Result<(), KgAgentError> {
        let machine = SqlGeneratorMachine::new(());

        let schema_prompt = build_schema_prompt(&state.table_contexts);
        let machine = machine
            .build_schema()
            .map_err(|(_, g)| map_guard_error("build_schema", &g))?;

        let examples = self.fetch_examples(state).await?;

        let draft = self.draft(state, &schema_prompt, &examples, None).await?;
        let machine = machine.draft().map_err(|(_, g)| map_guard_error("draft", &g))?;

        let issues = validate(&draft.sql, &state.table_contexts);
        let (final_draft, issues) = if issues.is_empty() {
            (draft, issues)
        } else {
            warn!(kg_id = %state.kg_id, issues = issues.len(), "drafted sql failed local validation; attempting one self-correction");
            let corrected = self
                .draft(state, &schema_prompt, &examples, Some(&issues))
                .await?;
            let corrected_issues = validate(&corrected.sql, &state.table_contexts);
            (corrected, corrected_issues)
        };

        if !issues.is_empty() {
            warn!(
                kg_id = %state.kg_id,
                issues = ?issues.iter().map(|i| i.0.clone()).collect::<Vec<_>>(),
                "sql still fails local validation after self-correction; deferring to executor"
            );
        }

        state.generated_sql = Some(final_draft.sql);
        state.explanation = Some(final_draft.explanation);
        state.confidence = Some(final_draft.confidence);

        let _machine = machine.validate().map_err(|(_, g)| map_guard_error("validate", &g))?;

        info!(kg_id = %state.kg_id, "sql generation complete");
        Ok(())
    }

    async fn fetch_examples(&self, state: &AgentState) -> Result<String, KgAgentError> {
        let Some(query_vector) = state.query_embedding.clone() else {
            return Ok(String::new());
        };
        let similar = self
            .query_memory
            .search_similar(&state.kg_id, query_vector, EXAMPLE_COUNT, true)
            .await?;

        if similar.is_empty() {
            return Ok(String::new());
        }

        let mut formatted = String::new();
        for scored in similar {
            if let Some(sql) = &scored.log.generated_sql {
                formatted.push_str(&format!(
                    "- Q: {}\n  SQL: {}\n",
                    scored.log.user_question, sql
                ));
            }
        }
        Ok(formatted)
    }

    async fn draft(
        &self,
        state: &AgentState,
        schema_prompt: &str,
        examples: &str,
        correction: Option<&[ValidationIssue]>,
    ) -> Result<SqlDraft, KgAgentError> {
        let correction_note = correction.map_or(String::new(), |issues| {
            let list: Vec<&str> = issues.iter().map(|i| i.0.as_str()).collect();
            format!("\nThe previous draft failed these checks, fix them: {}", list.join("; "))
        });

        let request = StructuredRequest {
            schema_name: "sql_generation",
            schema_description: "A single read-only SQL statement answering the question",
            schema: json!({
                "type": "object",
                "properties": {
                    "reasoning": {"type": "string"},
                    "sql": {"type": "string"},
                    "explanation": {"type": "string"},
                    "confidence": {"type": "number"}
                },
                "required": ["reasoning", "sql", "explanation", "confidence"],
                "additionalProperties": false
            }),
            system_prompt: "You write a single read-only SQL SELECT statement. Use fully-qualified column names. Never terminate the statement with a semicolon. Never use markdown or code fences. Always JOIN enrichment tables when they are present in the schema, and prefer human-readable columns over raw foreign-key ids when a referenced table is included.",
            user_prompt: format!(
                "Question: {}\nSchema:\n{}\nSimilar past queries:\n{}\nLearned sql lessons:\n{}{correction_note}",
                state.effective_query(),
                schema_prompt,
                if examples.is_empty() { "none" } else { examples },
                if state.sql_lessons.is_empty() { "none" } else { &state.sql_lessons },
            ),
        };

        self.llm.complete_structured(request).await
    }
}

fn build_schema_prompt(contexts: &[TableContext]) -> String {
    let mut prompt = String::new();
    for ctx in contexts {
        prompt.push_str(&format!("Table {} ({})\n", ctx.table.name, ctx.table.qualified_name));
        if let Some(description) = &ctx.table.description {
            prompt.push_str(&format!("  description: {description}\n"));
        }
        for column in &ctx.columns {
            let mut markers = Vec::new();
            if column.is_pk {
                markers.push("PK");
            }
            if column.is_fk {
                markers.push("FK");
            }
            if column.is_pii {
                markers.push("PII");
            }
            let marker_str = if markers.is_empty() { String::new() } else { format!(" [{}]", markers.join(",")) };
            let enum_preview = if column.enum_values.is_empty() {
                String::new()
            } else {
                format!(" enum: {:?}", column.enum_values)
            };
            prompt.push_str(&format!(
                "  - {} {}{}{}\n",
                column.name, column.data_type, marker_str, enum_preview
            ));
        }
        for rel in &ctx.relationships {
            prompt.push_str(&format!("  join: {}\n", rel.join_condition));
        }
    }
    prompt
}

fn validate(sql: &str, contexts: &[TableContext]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let trimmed = sql.trim();

    if trimmed.is_empty() {
        issues.push(ValidationIssue("sql is empty".to_string()));
        return issues;
    }
    if trimmed.matches(';').count() > 1 || (trimmed.ends_with(';') && trimmed.matches(';').count() == 1) {
        issues.push(ValidationIssue("sql must be a single statement with no trailing semicolon".to_string()));
    }
    if trimmed.chars().filter(|&c| c == '(').count() != trimmed.chars().filter(|&c| c == ')').count() {
        issues.push(ValidationIssue("unbalanced parentheses".to_string()));
    }
    if trimmed.chars().filter(|&c| c == '\'').count() % 2 != 0 {
        issues.push(ValidationIssue("unbalanced single quotes".to_string()));
    }
    let upper = trimmed.to_uppercase();
    if upper.contains("SELECT") && !upper.contains("FROM") {
        issues.push(ValidationIssue("SELECT statement missing FROM clause".to_string()));
    }

    const DANGEROUS_PATTERNS: &[&str] = &["; DROP", "; DELETE", "; INSERT", "; UPDATE", "--", "/*"];
    for pattern in DANGEROUS_PATTERNS {
        if upper.contains(&pattern.to_uppercase()) {
            issues.push(ValidationIssue(format!("sql contains disallowed pattern: {pattern}")));
        }
    }

    for ctx in contexts {
        if !upper.contains(&ctx.table.name.to_uppercase()) {
            tracing::debug!(table = %ctx.table.name, "expected table name not found verbatim in sql; may be referenced via alias");
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_flags_trailing_semicolon_and_dangerous_pattern() {
        let issues = validate("SELECT * FROM orders; DROP TABLE orders", &[]);
        assert!(!issues.is_empty());
    }

    #[test]
    fn validate_accepts_clean_select() {
        let issues = validate("SELECT o.id FROM orders o JOIN customers c ON o.customer_id = c.id", &[]);
        assert!(issues.is_empty());
    }

    #[test]
    fn validate_flags_missing_from() {
        let issues = validate("SELECT 1", &[]);
        assert!(issues.iter().any(|i| i.0.contains("FROM")));
    }
}
