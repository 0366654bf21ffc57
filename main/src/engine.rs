use std::collections::HashMap;
use std::sync::Arc;

use agents::state::AgentState;
use agents::{ErrorRouter, ExecutorValidator, SchemaSelector, SqlGenerator};
use async_trait::async_trait;
use common::error::KgAgentError;
use common::llm::{LlmCapability, OpenAiLlm};
use common::storage::db::SurrealDbClient;
use common::storage::types::knowledge_graph::KnowledgeGraph;
use common::utils::config::AppConfig;
use error_summary::ErrorSummaryManager;
use kg_builder::{BuildConfig, KgBuilder};
use kg_manager::KgManager;
use kg_store::{KgRepository, VectorIndex};
use query_memory::QueryMemory;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use workflow::QueryWorkflow;

use crate::types::{
    ConnectOrBuildKgRequest, FeedbackResult, KgListItem, KgLoadResult, QueryMetadata, QueryResult,
};

/// The five operations an external driver (CLI, HTTP service, UI) calls into. Kept as a
/// trait, separate from the concrete wiring in [`Engine`], so a driver can depend on the
/// interface rather than the construction details.
#[async_trait]
pub trait KgAgentEngine: Send + Sync {
    async fn connect_or_build_kg(&self, request: ConnectOrBuildKgRequest) -> Result<KgLoadResult, KgAgentError>;
    async fn list_kgs(&self) -> Result<Vec<KgListItem>, KgAgentError>;
    async fn load_kg(&self, kg_id: &str) -> Result<KgLoadResult, KgAgentError>;
    async fn process_query(
        &self,
        kg_id: &str,
        user_query: String,
        clarifications: Vec<String>,
    ) -> Result<QueryResult, KgAgentError>;
    async fn submit_feedback(
        &self,
        query_log_id: &str,
        feedback_text: String,
        rating: Option<u8>,
    ) -> Result<FeedbackResult, KgAgentError>;
}

/// Wires every component crate together behind the public API. Each knowledge graph may
/// describe a different target database, so target-DB connection pools are cached per
/// `kg_id` rather than fixed at construction; `AppConfig`'s `default_target_db` only seeds
/// the pool for whichever KG that configured database fingerprints to.
pub struct Engine {
    repository: KgRepository,
    vector_index: VectorIndex,
    kg_manager: KgManager,
    query_memory: QueryMemory,
    error_summary: ErrorSummaryManager,
    target_pools: RwLock<HashMap<String, PgPool>>,
    llm: Arc<dyn LlmCapability>,
    config: AppConfig,
}

impl Engine {
    #[instrument(level = "trace", skip(config))]
    pub async fn new(config: AppConfig) -> Result<Self, KgAgentError> {
        let store_db = Arc::new(
            SurrealDbClient::new(
                &config.vector_store_address,
                &config.store_username,
                &config.store_password,
                &config.store_namespace,
                &config.store_database,
            )
            .await?,
        );
        store_db.ensure_initialized(config.embedding_dimension).await?;

        let openai_client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );
        let llm: Arc<dyn LlmCapability> = Arc::new(OpenAiLlm::new(
            openai_client,
            config.openai_chat_model.clone(),
            config.openai_embedding_model.clone(),
            config.embedding_dimension,
        ));

        let repository = KgRepository::new(store_db.clone());
        let vector_index = VectorIndex::new(store_db.clone());
        let kg_manager = KgManager::new(repository.clone(), vector_index.clone(), config.openai_embedding_model.clone());
        let query_memory = QueryMemory::new(store_db.clone());
        let error_summary = ErrorSummaryManager::new(store_db.clone());

        let mut target_pools = HashMap::new();
        if let Some(target_db) = config.default_target_db() {
            let kg_id = KnowledgeGraph::fingerprint(&target_db.kg_host, target_db.kg_port, &target_db.kg_database);
            let pool = Self::connect_pool(
                &target_db.kg_host,
                target_db.kg_port,
                &target_db.kg_database,
                &target_db.kg_user,
                &target_db.kg_password,
            )
            .await?;
            target_pools.insert(kg_id, pool);
        }

        Ok(Self {
            repository,
            vector_index,
            kg_manager,
            query_memory,
            error_summary,
            target_pools: RwLock::new(target_pools),
            llm,
            config,
        })
    }

    async fn connect_pool(host: &str, port: u16, database: &str, user: &str, password: &str) -> Result<PgPool, KgAgentError> {
        Ok(PgPoolOptions::new()
            .max_connections(10)
            .connect(&format!("postgres://{user}:{password}@{host}:{port}/{database}"))
            .await?)
    }

    /// Looks up the cached connection pool for `kg_id`, falling back to `AppConfig`'s
    /// configured default target database only when it describes the same host/port/database
    /// this KG was built from (e.g. after a process restart that dropped the cache).
    async fn pool_for(&self, kg_id: &str, host: &str, port: u16, database: &str) -> Result<PgPool, KgAgentError> {
        if let Some(pool) = self.target_pools.read().await.get(kg_id) {
            return Ok(pool.clone());
        }

        if let Some(default_db) = self.config.default_target_db() {
            if default_db.kg_host == host && default_db.kg_port == port && default_db.kg_database == database {
                let pool = Self::connect_pool(host, port, database, &default_db.kg_user, &default_db.kg_password).await?;
                self.target_pools.write().await.insert(kg_id.to_string(), pool.clone());
                return Ok(pool);
            }
        }

        Err(KgAgentError::Validation(format!(
            "no cached target-database connection for kg {kg_id}; call connect_or_build_kg with credentials first"
        )))
    }
}

#[async_trait]
impl KgAgentEngine for Engine {
    #[instrument(level = "trace", skip(self, request))]
    async fn connect_or_build_kg(&self, request: ConnectOrBuildKgRequest) -> Result<KgLoadResult, KgAgentError> {
        let schema_namespace = "public".to_string();

        let existing_count = self
            .repository
            .list_kgs()
            .await?
            .into_iter()
            .filter(|kg| kg.host == request.host && kg.port == request.port && kg.database_name == request.database)
            .count();
        let was_freshly_built = existing_count == 0;

        let pool = Self::connect_pool(&request.host, request.port, &request.database, &request.user, &request.password).await?;

        let build_config = BuildConfig {
            skip_enrichment: !request.generate_descriptions,
            skip_embedding: !request.generate_embeddings,
            embedding_model_id: self.config.openai_embedding_model.clone(),
        };
        let kg_builder = KgBuilder::new(self.repository.clone(), self.vector_index.clone(), build_config);

        let kg = kg_builder
            .build(
                &pool,
                request.host,
                request.port,
                request.database,
                schema_namespace,
                Some(self.llm.as_ref()),
                None,
            )
            .await?;

        self.target_pools.write().await.insert(kg.id.clone(), pool);
        self.kg_manager.invalidate(&kg.id).await;
        let tables = self.repository.get_tables(&kg.id).await?;

        Ok(KgLoadResult {
            kg_id: kg.id,
            status: kg.status,
            version: kg.version,
            table_count: tables.len(),
            was_freshly_built,
        })
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_kgs(&self) -> Result<Vec<KgListItem>, KgAgentError> {
        let kgs = self.repository.list_kgs().await?;
        Ok(kgs
            .into_iter()
            .map(|kg| KgListItem {
                kg_id: kg.id,
                host: kg.host,
                port: kg.port,
                database_name: kg.database_name,
                status: kg.status,
                version: kg.version,
            })
            .collect())
    }

    #[instrument(level = "trace", skip(self))]
    async fn load_kg(&self, kg_id: &str) -> Result<KgLoadResult, KgAgentError> {
        let loaded = self
            .kg_manager
            .load(kg_id, Some(self.llm.as_ref()))
            .await?
            .ok_or_else(|| KgAgentError::KgNotFound(kg_id.to_string()))?;

        Ok(KgLoadResult {
            kg_id: loaded.kg.id.clone(),
            status: loaded.kg.status.clone(),
            version: loaded.kg.version,
            table_count: loaded.tables.len(),
            was_freshly_built: false,
        })
    }

    #[instrument(level = "trace", skip(self, user_query, clarifications))]
    async fn process_query(
        &self,
        kg_id: &str,
        user_query: String,
        clarifications: Vec<String>,
    ) -> Result<QueryResult, KgAgentError> {
        let loaded = self
            .kg_manager
            .load(kg_id, Some(self.llm.as_ref()))
            .await?
            .ok_or_else(|| KgAgentError::KgNotFound(kg_id.to_string()))?;

        let pool = self
            .pool_for(kg_id, &loaded.kg.host, loaded.kg.port, &loaded.kg.database_name)
            .await?;

        let summary = self
            .error_summary
            .get_or_create(kg_id, self.config.compression_threshold)
            .await?;

        let mut state = AgentState::new(
            kg_id.to_string(),
            user_query,
            summary.schema_lessons.clone(),
            summary.sql_lessons.clone(),
        );
        state.max_retries = self.config.max_retries;
        state.clarifications_provided = clarifications;

        let schema_selector = SchemaSelector::new(self.llm.as_ref(), &self.vector_index);
        let sql_generator = SqlGenerator::new(self.llm.as_ref(), &self.query_memory);
        let error_router = ErrorRouter::new(self.llm.as_ref());
        let executor_validator = ExecutorValidator::new(&pool, &self.query_memory, &error_router, &self.error_summary, self.llm.as_ref());

        let workflow = QueryWorkflow::new(schema_selector, sql_generator, executor_validator);
        let final_state = workflow.run(state, &loaded).await?;

        if final_state.error_info.is_none() && final_state.execution_result.is_some() {
            if let Err(err) = self
                .maybe_compress_lessons(kg_id)
                .await
            {
                warn!(kg_id, error = %err, "lesson compression check failed; continuing");
            }
        }

        let metadata = QueryMetadata {
            tables_selected: final_state.final_tables.clone(),
            iterations: final_state.retry_count + 1,
            error_history: final_state.error_history.clone(),
            timing_ms: final_state.timing_ms.clone(),
        };

        Ok(QueryResult {
            success: final_state.execution_result.is_some(),
            sql: final_state.generated_sql.clone(),
            explanation: final_state.explanation.clone(),
            confidence: final_state.confidence,
            result: final_state.execution_result.clone(),
            error: final_state.error_info.as_ref().map(|e| e.message.clone()),
            error_category: final_state.error_info.as_ref().map(|e| e.category.clone()),
            needs_clarification: false,
            clarification_request: None,
            metadata,
        })
    }

    #[instrument(level = "trace", skip(self, feedback_text))]
    async fn submit_feedback(
        &self,
        query_log_id: &str,
        feedback_text: String,
        rating: Option<u8>,
    ) -> Result<FeedbackResult, KgAgentError> {
        self.query_memory
            .update_feedback(query_log_id, feedback_text.clone(), rating)
            .await?;

        let Some(log) = self.query_memory.get(query_log_id).await? else {
            return Ok(FeedbackResult {
                success: true,
                lesson_recorded: false,
            });
        };

        let negative = rating.map(|r| r <= 2).unwrap_or(false) || !log.success;
        if !negative {
            return Ok(FeedbackResult {
                success: true,
                lesson_recorded: false,
            });
        }

        self.error_summary
            .append_from_feedback(
                &log.kg_id,
                &log.user_question,
                log.generated_sql.as_deref().unwrap_or(""),
                log.success,
                &feedback_text,
                rating,
                self.llm.as_ref(),
            )
            .await?;

        if let Err(err) = self.maybe_compress_lessons(&log.kg_id).await {
            warn!(kg_id = %log.kg_id, error = %err, "lesson compression check failed; continuing");
        }

        info!(query_log_id, "negative feedback lesson recorded");
        Ok(FeedbackResult {
            success: true,
            lesson_recorded: true,
        })
    }
}

impl Engine {
    async fn maybe_compress_lessons(&self, kg_id: &str) -> Result<(), KgAgentError> {
        let compressed = self.error_summary.compress_if_needed(kg_id, self.llm.as_ref()).await?;
        if compressed {
            info!(kg_id, "error summary compacted");
        }
        Ok(())
    }
}
