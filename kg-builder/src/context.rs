use common::llm::LlmCapability;
use common::storage::types::column::Column;
use common::storage::types::knowledge_graph::KnowledgeGraph;
use common::storage::types::relationship::Relationship;
use common::storage::types::table::Table;
use common::storage::types::vector_embedding::VectorEmbedding;
use kg_store::{KgRepository, VectorIndex};
use schema_extractor::ExtractedSchema;
use sqlx::PgPool;

use crate::progress::ProgressCallback;

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub skip_enrichment: bool,
    pub skip_embedding: bool,
    pub embedding_model_id: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            skip_enrichment: false,
            skip_embedding: false,
            embedding_model_id: "text-embedding-3-small".to_string(),
        }
    }
}

pub struct BuildContext<'a> {
    pub repository: &'a KgRepository,
    pub vector_index: &'a VectorIndex,
    pub pool: &'a PgPool,
    pub llm: Option<&'a dyn LlmCapability>,
    pub config: &'a BuildConfig,
    pub progress: &'a Option<ProgressCallback>,

    pub kg: Option<KnowledgeGraph>,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub schema_namespace: String,
    pub extracted: Option<ExtractedSchema>,
    pub tables: Vec<Table>,
    pub columns: Vec<Column>,
    pub relationships: Vec<Relationship>,
    pub embeddings: Vec<VectorEmbedding>,
    pub already_built: bool,
}

impl<'a> BuildContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: &'a KgRepository,
        vector_index: &'a VectorIndex,
        pool: &'a PgPool,
        llm: Option<&'a dyn LlmCapability>,
        config: &'a BuildConfig,
        progress: &'a Option<ProgressCallback>,
        host: String,
        port: u16,
        database_name: String,
        schema_namespace: String,
    ) -> Self {
        Self {
            repository,
            vector_index,
            pool,
            llm,
            config,
            progress,
            kg: None,
            host,
            port,
            database_name,
            schema_namespace,
            extracted: None,
            tables: Vec::new(),
            columns: Vec::new(),
            relationships: Vec::new(),
            embeddings: Vec::new(),
            already_built: false,
        }
    }

    pub fn kg(&self) -> &KnowledgeGraph {
        self.kg.as_ref().expect("kg set after insert_metadata stage")
    }

    pub fn kg_id(&self) -> String {
        self.kg().id.clone()
    }
}
