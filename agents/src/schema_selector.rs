use std::collections::{HashMap, HashSet, VecDeque};

use common::error::KgAgentError;
use common::llm::{LlmCapability, LlmCapabilityExt, StructuredRequest};
use common::storage::types::relationship::Relationship;
use common::storage::types::vector_embedding::EmbeddingEntityType;
use kg_manager::LoadedKg;
use kg_store::{TableContext, VectorIndex};
use serde::Deserialize;
use serde_json::json;
use state_machines::state_machine;
use tracing::{info, instrument, warn};

use crate::state::AgentState;

state_machine! {
    name: SchemaSelectorMachine,
    state: SchemaSelectorState,
    initial: Ready,
    states: [Ready, Embedded, Searched, Filtered, BridgeExpanded, Loaded, Failed],
    events {
        embed_query { transition: { from: Ready, to: Embedded } }
        search { transition: { from: Embedded, to: Searched } }
        filter { transition: { from: Searched, to: Filtered } }
        expand_bridges { transition: { from: Filtered, to: BridgeExpanded } }
        load_contexts { transition: { from: BridgeExpanded, to: Loaded } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: Searched, to: Failed }
            transition: { from: Filtered, to: Failed }
            transition: { from: BridgeExpanded, to: Failed }
        }
    }
}

fn map_guard_error(event: &str, guard: &state_machines::core::GuardError) -> KgAgentError {
    KgAgentError::InternalError(format!("invalid schema-selector transition during {event}: {guard:?}"))
}

const CANDIDATE_K: usize = 10;

#[derive(Debug, Clone)]
struct Candidate {
    table_name: String,
    similarity: f32,
    document: String,
}

#[derive(Debug, Deserialize)]
struct TableFilterResponse {
    selected_tables: Vec<String>,
    #[allow(dead_code)]
    reasoning: String,
    confidence: f64,
}

/// Picks the minimal table set relevant to a query: vector search for candidates, an
/// LLM filter down to a small selection, then graph traversal to pull in bridging and
/// FK-enrichment tables the filter didn't name explicitly.
pub struct SchemaSelector<'a> {
    llm: &'a dyn LlmCapability,
    vector_index: &'a VectorIndex,
}

impl<'a> SchemaSelector<'a> {
    pub fn new(llm: &'a dyn LlmCapability, vector_index: &'a VectorIndex) -> Self {
        Self { llm, vector_index }
    }

    #[instrument(level = "trace", skip_all, fields(kg_id = %state.kg_id))]
    pub async fn run(&self, state: &mut AgentState, kg: &LoadedKg) -> Result<(), KgAgentError> {
        let machine = SchemaSelectorMachine::new(());

        let query_vector = self.llm.embed(state.effective_query()).await?;
        state.query_embedding = Some(query_vector.clone());
        let machine = machine
            .embed_query()
            .map_err(|(_, g)| map_guard_error("embed_query", &g))?;

        let scored = self
            .vector_index
            .search(&state.kg_id, query_vector, Some(EmbeddingEntityType::Table), CANDIDATE_K)
            .await?;
        let machine = machine.search().map_err(|(_, g)| map_guard_error("search", &g))?;

        let candidates: Vec<Candidate> = scored
            .iter()
            .filter_map(|entry| {
                entry.entity_id.strip_prefix("table_").map(|name| Candidate {
                    table_name: name.to_string(),
                    similarity: entry.score,
                    document: entry.text.clone(),
                })
            })
            .collect();
        state.candidate_tables = candidates.iter().map(|c| c.table_name.clone()).collect();

        let filtered = self.filter(state, kg, &candidates).await?;
        state.schema_selection_confidence = Some(filtered.confidence);
        let machine = machine.filter().map_err(|(_, g)| map_guard_error("filter", &g))?;

        let mut selected_ids: HashSet<String> = filtered
            .selected_tables
            .iter()
            .filter_map(|name| kg.table_by_name(name).map(|t| t.id.clone()))
            .collect();
        if selected_ids.is_empty() {
            warn!(kg_id = %state.kg_id, "schema filter returned no known tables; falling back to top candidate");
            if let Some(first) = candidates.first().and_then(|c| kg.table_by_name(&c.table_name)) {
                selected_ids.insert(first.id.clone());
            }
        }
        state.selected_tables = selected_ids.iter().cloned().collect();

        let adjacency = build_adjacency(&kg.relationships);
        let bridging = bridge_tables(&selected_ids, &adjacency);
        state.bridging_tables = bridging.iter().cloned().collect();

        let mut covered: HashSet<String> = selected_ids.union(&bridging).cloned().collect();
        let enrichment = enrichment_tables(&covered, &kg.relationships);
        state.enrichment_tables = enrichment.iter().cloned().collect();
        covered.extend(enrichment);

        if !is_connected(&covered, &adjacency) {
            warn!(kg_id = %state.kg_id, tables = covered.len(), "final table set spans more than one connected component");
        }

        let machine = machine
            .expand_bridges()
            .map_err(|(_, g)| map_guard_error("expand_bridges", &g))?;

        let mut final_ids: Vec<String> = covered.into_iter().collect();
        final_ids.sort();
        state.final_tables = final_ids.clone();
        state.table_contexts = final_ids
            .iter()
            .filter_map(|id| {
                let table = kg.table_by_id(id)?;
                let columns = kg.columns_for(id).to_vec();
                let relationships = kg
                    .relationships
                    .iter()
                    .filter(|r| &r.from_table_id == id || &r.to_table_id == id)
                    .cloned()
                    .collect();
                Some(TableContext {
                    table: table.clone(),
                    columns,
                    relationships,
                })
            })
            .collect();

        let _machine = machine
            .load_contexts()
            .map_err(|(_, g)| map_guard_error("load_contexts", &g))?;

        info!(
            kg_id = %state.kg_id,
            selected = state.selected_tables.len(),
            bridging = state.bridging_tables.len(),
            enrichment = state.enrichment_tables.len(),
            "schema selection complete"
        );
        Ok(())
    }

    async fn filter(
        &self,
        state: &AgentState,
        kg: &LoadedKg,
        candidates: &[Candidate],
    ) -> Result<TableFilterResponse, KgAgentError> {
        let candidate_summary: Vec<_> = candidates
            .iter()
            .map(|c| {
                let domain = kg
                    .table_by_name(&c.table_name)
                    .and_then(|t| t.business_domain.clone())
                    .unwrap_or_default();
                json!({
                    "table": c.table_name,
                    "domain": domain,
                    "similarity": c.similarity,
                    "document": c.document,
                })
            })
            .collect();

        let request = StructuredRequest {
            schema_name: "schema_selection",
            schema_description: "The minimal set of tables needed to answer a natural-language question",
            schema: json!({
                "type": "object",
                "properties": {
                    "selected_tables": {"type": "array", "items": {"type": "string"}},
                    "reasoning": {"type": "string"},
                    "confidence": {"type": "number"}
                },
                "required": ["selected_tables", "reasoning", "confidence"],
                "additionalProperties": false
            }),
            system_prompt: "You select the minimal set (2 to 5) of candidate tables needed to answer a question over a relational database. Prefer fewer tables when one suffices.",
            user_prompt: format!(
                "Question: {}\nLearned schema lessons:\n{}\nCandidates: {}",
                state.effective_query(),
                if state.schema_lessons.is_empty() { "none" } else { &state.schema_lessons },
                serde_json::Value::Array(candidate_summary)
            ),
        };

        self.llm.complete_structured(request).await
    }
}

fn build_adjacency(relationships: &[Relationship]) -> HashMap<String, Vec<String>> {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for rel in relationships {
        adjacency
            .entry(rel.from_table_id.clone())
            .or_default()
            .push(rel.to_table_id.clone());
        adjacency
            .entry(rel.to_table_id.clone())
            .or_default()
            .push(rel.from_table_id.clone());
    }
    adjacency
}

/// BFS shortest path between every pair of selected tables; every intermediate table
/// visited along the way is a bridging table.
fn bridge_tables(selected: &HashSet<String>, adjacency: &HashMap<String, Vec<String>>) -> HashSet<String> {
    let mut bridging = HashSet::new();
    let ordered: Vec<&String> = selected.iter().collect();

    for i in 0..ordered.len() {
        for j in (i + 1)..ordered.len() {
            if let Some(path) = shortest_path(ordered[i], ordered[j], adjacency) {
                for node in path.iter().skip(1).take(path.len().saturating_sub(2)) {
                    if !selected.contains(node) {
                        bridging.insert(node.clone());
                    }
                }
            }
        }
    }
    bridging
}

fn shortest_path(from: &str, to: &str, adjacency: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    if from == to {
        return Some(vec![from.to_string()]);
    }
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<Vec<String>> = VecDeque::new();
    visited.insert(from.to_string());
    queue.push_back(vec![from.to_string()]);

    while let Some(path) = queue.pop_front() {
        let Some(last) = path.last() else { continue };
        let Some(neighbors) = adjacency.get(last) else { continue };
        for neighbor in neighbors {
            if neighbor == to {
                let mut found = path.clone();
                found.push(neighbor.clone());
                return Some(found);
            }
            if visited.insert(neighbor.clone()) {
                let mut extended = path.clone();
                extended.push(neighbor.clone());
                queue.push_back(extended);
            }
        }
    }
    None
}

/// Any FK from a covered table to an uncovered, non-self-referencing table pulls that
/// referenced table in so the SQL generator can `JOIN` to human-readable columns.
fn enrichment_tables(covered: &HashSet<String>, relationships: &[Relationship]) -> HashSet<String> {
    relationships
        .iter()
        .filter(|r| !r.is_self_reference && covered.contains(&r.from_table_id) && !covered.contains(&r.to_table_id))
        .map(|r| r.to_table_id.clone())
        .collect()
}

fn is_connected(tables: &HashSet<String>, adjacency: &HashMap<String, Vec<String>>) -> bool {
    let Some(start) = tables.iter().next() else {
        return true;
    };
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    visited.insert(start.clone());
    queue.push_back(start.clone());

    while let Some(node) = queue.pop_front() {
        let Some(neighbors) = adjacency.get(&node) else { continue };
        for neighbor in neighbors {
            if tables.contains(neighbor) && visited.insert(neighbor.clone()) {
                queue.push_back(neighbor.clone());
            }
        }
    }
    visited.len() == tables.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::relationship::RelationshipType;

    fn rel(from: &str, to: &str) -> Relationship {
        Relationship::new(
            "kg1".to_string(),
            from.to_string(),
            to.to_string(),
            "id".to_string(),
            "id".to_string(),
            RelationshipType::ManyToOne,
            format!("{from}.id = {to}.id"),
            false,
            None,
        )
    }

    #[test]
    fn bridge_tables_finds_intermediate_hop() {
        let relationships = vec![rel("orders", "customers"), rel("order_items", "orders")];
        let adjacency = build_adjacency(&relationships);
        let selected: HashSet<String> = ["order_items".to_string(), "customers".to_string()].into_iter().collect();
        let bridging = bridge_tables(&selected, &adjacency);
        assert!(bridging.contains("orders"));
    }

    #[test]
    fn enrichment_tables_skips_self_references() {
        let mut self_ref = rel("employees", "employees");
        self_ref.is_self_reference = true;
        let relationships = vec![rel("orders", "customers"), self_ref];
        let covered: HashSet<String> = ["orders".to_string(), "employees".to_string()].into_iter().collect();
        let enrichment = enrichment_tables(&covered, &relationships);
        assert_eq!(enrichment, HashSet::from(["customers".to_string()]));
    }

    #[test]
    fn is_connected_detects_disjoint_components() {
        let relationships = vec![rel("a", "b")];
        let adjacency = build_adjacency(&relationships);
        let tables: HashSet<String> = ["a".to_string(), "b".to_string(), "c".to_string()].into_iter().collect();
        assert!(!is_connected(&tables, &adjacency));
    }
}
