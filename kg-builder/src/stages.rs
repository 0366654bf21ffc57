use common::error::KgAgentError;
use common::llm::{LlmCapabilityExt, StructuredRequest};
use common::storage::types::column::Column;
use common::storage::types::knowledge_graph::KgStatus;
use common::storage::types::relationship::Relationship;
use common::storage::types::table::Table;
use common::storage::types::vector_embedding::{EmbeddingEntityType, VectorEmbedding};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::context::BuildContext;
use crate::progress;
use crate::state::{
    BuildMachine, Embedded, Enriched, Extracted, IndexPopulated, MetadataInserted, Ready,
};

fn map_guard_error(event: &str, guard: &state_machines::core::GuardError) -> KgAgentError {
    KgAgentError::InternalError(format!("invalid kg build transition during {event}: {guard:?}"))
}

fn map_cardinality(
    cardinality: &schema_extractor::columns::Cardinality,
) -> common::storage::types::column::Cardinality {
    match cardinality {
        schema_extractor::columns::Cardinality::Low => common::storage::types::column::Cardinality::Low,
        schema_extractor::columns::Cardinality::Medium => {
            common::storage::types::column::Cardinality::Medium
        }
        schema_extractor::columns::Cardinality::High => common::storage::types::column::Cardinality::High,
    }
}

fn map_relationship_type(
    relationship_type: &schema_extractor::relationships::RelationshipType,
) -> common::storage::types::relationship::RelationshipType {
    match relationship_type {
        schema_extractor::relationships::RelationshipType::OneToOne => {
            common::storage::types::relationship::RelationshipType::OneToOne
        }
        schema_extractor::relationships::RelationshipType::ManyToOne => {
            common::storage::types::relationship::RelationshipType::ManyToOne
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality_mapping_is_lossless() {
        assert_eq!(
            map_cardinality(&schema_extractor::columns::Cardinality::Low),
            common::storage::types::column::Cardinality::Low
        );
        assert_eq!(
            map_cardinality(&schema_extractor::columns::Cardinality::High),
            common::storage::types::column::Cardinality::High
        );
    }

    #[test]
    fn relationship_type_mapping_is_lossless() {
        assert_eq!(
            map_relationship_type(&schema_extractor::relationships::RelationshipType::OneToOne),
            common::storage::types::relationship::RelationshipType::OneToOne
        );
    }
}

#[instrument(level = "trace", skip_all)]
pub async fn insert_metadata(
    machine: BuildMachine<(), Ready>,
    ctx: &mut BuildContext<'_>,
) -> Result<BuildMachine<(), MetadataInserted>, KgAgentError> {
    let (kg, created) = ctx
        .repository
        .create_or_get(
            ctx.host.clone(),
            ctx.port,
            ctx.database_name.clone(),
            ctx.schema_namespace.clone(),
        )
        .await?;

    ctx.already_built = !created && kg.status == KgStatus::Ready;
    info!(kg_id = %kg.id, created, "knowledge graph metadata resolved");
    progress::emit(
        ctx.progress,
        "metadata",
        format!("resolved knowledge graph {}", kg.id),
        0.05,
    );
    ctx.kg = Some(kg);

    machine
        .insert_metadata()
        .map_err(|(_, guard)| map_guard_error("insert_metadata", &guard))
}

#[instrument(level = "trace", skip_all, fields(kg_id = %ctx.kg_id()))]
pub async fn extract(
    machine: BuildMachine<(), MetadataInserted>,
    ctx: &mut BuildContext<'_>,
) -> Result<BuildMachine<(), Extracted>, KgAgentError> {
    if ctx.already_built {
        debug!("knowledge graph already built; skipping extraction");
        return machine
            .extract()
            .map_err(|(_, guard)| map_guard_error("extract", &guard));
    }

    let extracted = schema_extractor::extract_schema(ctx.pool, &ctx.schema_namespace, ctx.llm).await?;
    info!(
        tables = extracted.tables.len(),
        columns = extracted.columns.len(),
        relationships = extracted.relationships.len(),
        "schema extraction complete"
    );
    progress::emit(
        ctx.progress,
        "extraction",
        format!("extracted {} tables", extracted.tables.len()),
        0.2,
    );

    let kg_id = ctx.kg_id();
    let mut table_ids_by_name = std::collections::HashMap::new();
    for extracted_table in &extracted.tables {
        let table = Table::new(
            kg_id.clone(),
            extracted_table.name.clone(),
            extracted_table.schema_namespace.clone(),
            extracted_table.row_count_estimate,
        );
        table_ids_by_name.insert(extracted_table.name.clone(), table.id.clone());
        ctx.tables.push(table);
    }

    for extracted_column in &extracted.columns {
        let Some(table_id) = table_ids_by_name.get(&extracted_column.table_name) else {
            continue;
        };
        let cardinality = extracted_column.cardinality.as_ref().map(map_cardinality);
        let column = Column::new(
            table_id.clone(),
            extracted_column.name.clone(),
            extracted_column.qualified_name.clone(),
            extracted_column.data_type.clone(),
            extracted_column.nullable,
            extracted_column.is_pk,
            extracted_column.is_unique,
            extracted_column.is_fk,
            extracted_column.position,
            extracted_column.sample_values.clone(),
            extracted_column.enum_values.clone(),
            cardinality,
            extracted_column.null_pct,
            extracted_column.is_pii,
        );
        ctx.columns.push(column);
    }

    for extracted_relationship in &extracted.relationships {
        let (Some(from_id), Some(to_id)) = (
            table_ids_by_name.get(&extracted_relationship.from_table),
            table_ids_by_name.get(&extracted_relationship.to_table),
        ) else {
            continue;
        };
        let relationship_type = map_relationship_type(&extracted_relationship.relationship_type);
        ctx.relationships.push(Relationship::new(
            kg_id.clone(),
            from_id.clone(),
            to_id.clone(),
            extracted_relationship.from_column.clone(),
            extracted_relationship.to_column.clone(),
            relationship_type,
            extracted_relationship.join_condition.clone(),
            extracted_relationship.is_self_reference,
            Some(extracted_relationship.constraint_name.clone()),
        ));
    }

    ctx.repository.insert_tables(&ctx.tables).await?;
    ctx.repository.insert_columns(&ctx.columns).await?;
    ctx.repository.insert_relationships(&ctx.relationships).await?;

    ctx.extracted = Some(extracted);

    machine
        .extract()
        .map_err(|(_, guard)| map_guard_error("extract", &guard))
}

#[derive(Debug, Deserialize)]
struct TableEnrichment {
    description: String,
    business_domain: String,
    typical_use_cases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnEnrichment {
    description: String,
    business_meaning: String,
}

#[instrument(level = "trace", skip_all, fields(kg_id = %ctx.kg_id()))]
pub async fn enrich(
    machine: BuildMachine<(), Extracted>,
    ctx: &mut BuildContext<'_>,
) -> Result<BuildMachine<(), Enriched>, KgAgentError> {
    if ctx.already_built || ctx.config.skip_enrichment {
        debug!("skipping enrichment");
        return machine
            .enrich()
            .map_err(|(_, guard)| map_guard_error("enrich", &guard));
    }

    let Some(llm) = ctx.llm else {
        debug!("no llm configured; skipping enrichment");
        return machine
            .enrich()
            .map_err(|(_, guard)| map_guard_error("enrich", &guard));
    };

    for table in ctx.tables.iter_mut() {
        let request = StructuredRequest {
            schema_name: "table_enrichment",
            schema_description: "A short business description of a database table",
            schema: json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "business_domain": {"type": "string"},
                    "typical_use_cases": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["description", "business_domain", "typical_use_cases"],
                "additionalProperties": false
            }),
            system_prompt: "You describe database tables for a team building a natural-language query assistant.",
            user_prompt: format!(
                "Table name: {}\nQualified name: {}\nRow count estimate: {:?}",
                table.name, table.qualified_name, table.row_count_estimate
            ),
        };

        match llm.complete_structured::<TableEnrichment>(request).await {
            Ok(enrichment) => {
                table.description = Some(enrichment.description);
                table.business_domain = Some(enrichment.business_domain);
                table.typical_use_cases = enrichment.typical_use_cases;
            }
            Err(err) => {
                warn!(table = %table.name, error = %err, "table enrichment failed; leaving description empty");
            }
        }
    }

    for column in ctx.columns.iter_mut() {
        if column.name.eq_ignore_ascii_case("id") || column.name.ends_with("_at") {
            continue;
        }
        let request = StructuredRequest {
            schema_name: "column_enrichment",
            schema_description: "A short business description of a database column",
            schema: json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "business_meaning": {"type": "string"}
                },
                "required": ["description", "business_meaning"],
                "additionalProperties": false
            }),
            system_prompt: "You describe database columns for a team building a natural-language query assistant.",
            user_prompt: format!(
                "Column: {}\nType: {}\nSample values: {:?}",
                column.qualified_name, column.data_type, column.sample_values
            ),
        };

        match llm.complete_structured::<ColumnEnrichment>(request).await {
            Ok(enrichment) => {
                column.description = Some(enrichment.description);
                column.business_meaning = Some(enrichment.business_meaning);
            }
            Err(err) => {
                warn!(column = %column.qualified_name, error = %err, "column enrichment failed; leaving description empty");
            }
        }
    }

    ctx.repository.insert_tables(&ctx.tables).await?;
    ctx.repository.insert_columns(&ctx.columns).await?;
    progress::emit(ctx.progress, "enrichment", "enriched tables and columns", 0.5);

    machine
        .enrich()
        .map_err(|(_, guard)| map_guard_error("enrich", &guard))
}

#[instrument(level = "trace", skip_all, fields(kg_id = %ctx.kg_id()))]
pub async fn embed(
    machine: BuildMachine<(), Enriched>,
    ctx: &mut BuildContext<'_>,
) -> Result<BuildMachine<(), Embedded>, KgAgentError> {
    if ctx.already_built || ctx.config.skip_embedding {
        debug!("skipping embedding");
        return machine
            .embed()
            .map_err(|(_, guard)| map_guard_error("embed", &guard));
    }

    let Some(llm) = ctx.llm else {
        debug!("no llm configured; skipping embedding");
        return machine
            .embed()
            .map_err(|(_, guard)| map_guard_error("embed", &guard));
    };

    let kg_id = ctx.kg_id();
    for table in &ctx.tables {
        let document = table.document();
        let vector = llm.embed(&document).await?;
        let dim = vector.len();
        ctx.embeddings.push(VectorEmbedding::new(
            kg_id.clone(),
            EmbeddingEntityType::Table,
            format!("table_{}", table.name),
            document,
            vector,
            ctx.config.embedding_model_id.clone(),
            dim,
            table.metadata(),
        ));
    }

    for column in &ctx.columns {
        if !column.is_embeddable() {
            continue;
        }
        let document = column.document();
        let vector = llm.embed(&document).await?;
        let dim = vector.len();
        ctx.embeddings.push(VectorEmbedding::new(
            kg_id.clone(),
            EmbeddingEntityType::Column,
            format!("column_{}", column.qualified_name.replace('.', "_")),
            document,
            vector,
            ctx.config.embedding_model_id.clone(),
            dim,
            column.metadata(),
        ));
    }

    progress::emit(
        ctx.progress,
        "embedding",
        format!("embedded {} entities", ctx.embeddings.len()),
        0.7,
    );

    machine
        .embed()
        .map_err(|(_, guard)| map_guard_error("embed", &guard))
}

#[instrument(level = "trace", skip_all, fields(kg_id = %ctx.kg_id()))]
pub async fn populate_index(
    machine: BuildMachine<(), Embedded>,
    ctx: &mut BuildContext<'_>,
) -> Result<BuildMachine<(), IndexPopulated>, KgAgentError> {
    if !ctx.embeddings.is_empty() {
        ctx.vector_index.store_all(std::mem::take(&mut ctx.embeddings)).await?;
    }
    progress::emit(ctx.progress, "indexing", "vector index populated", 0.9);

    machine
        .populate_index()
        .map_err(|(_, guard)| map_guard_error("populate_index", &guard))
}
