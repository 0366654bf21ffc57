use crate::stored_object;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingEntityType {
    Table,
    Column,
}

stored_object!(VectorEmbedding, "kg_embeddings", {
    kg_id: String,
    entity_type: EmbeddingEntityType,
    entity_id: String,
    text: String,
    vector: Vec<f32>,
    model_id: String,
    dim: usize,
    metadata: serde_json::Value
});

impl VectorEmbedding {
    /// Record id embeds the entity id so re-embedding the same table/column/query
    /// overwrites the previous vector instead of accumulating stale duplicates.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kg_id: String,
        entity_type: EmbeddingEntityType,
        entity_id: String,
        text: String,
        vector: Vec<f32>,
        model_id: String,
        dim: usize,
        metadata: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: format!("{kg_id}_{entity_id}"),
            created_at: now,
            updated_at: now,
            kg_id,
            entity_type,
            entity_id,
            text,
            vector,
            model_id,
            dim,
            metadata,
        }
    }
}
