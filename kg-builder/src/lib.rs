pub mod context;
pub mod progress;
mod stages;
mod state;

use std::time::Instant;

use common::error::KgAgentError;
use common::llm::LlmCapability;
use common::storage::types::knowledge_graph::KgStatus;
use kg_store::{KgRepository, VectorIndex};
use sqlx::PgPool;
use tracing::{error, info, instrument};

pub use context::BuildConfig;
pub use progress::{ProgressCallback, ProgressEvent};

use context::BuildContext;

pub struct KgBuilder {
    repository: KgRepository,
    vector_index: VectorIndex,
    config: BuildConfig,
}

impl KgBuilder {
    pub fn new(repository: KgRepository, vector_index: VectorIndex, config: BuildConfig) -> Self {
        Self {
            repository,
            vector_index,
            config,
        }
    }

    /// Drives the full build pipeline for one target database. Idempotent: if a KG for this
    /// `(host, port, database)` already completed, extraction/enrichment/embedding are skipped
    /// and the existing row is returned.
    #[instrument(level = "trace", skip(self, pool, llm, progress))]
    pub async fn build(
        &self,
        pool: &PgPool,
        host: String,
        port: u16,
        database_name: String,
        schema_namespace: String,
        llm: Option<&dyn LlmCapability>,
        progress: Option<ProgressCallback>,
    ) -> Result<common::storage::types::knowledge_graph::KnowledgeGraph, KgAgentError> {
        let started = Instant::now();
        let mut ctx = BuildContext::new(
            &self.repository,
            &self.vector_index,
            pool,
            llm,
            &self.config,
            &progress,
            host,
            port,
            database_name,
            schema_namespace,
        );

        let result = self.drive(&mut ctx).await;

        match result {
            Ok(()) => {
                let kg = ctx
                    .repository
                    .mark_status(ctx.kg.take().expect("kg set"), KgStatus::Ready, None)
                    .await?;
                info!(kg_id = %kg.id, elapsed_ms = started.elapsed().as_millis(), "knowledge graph build finished");
                Ok(kg)
            }
            Err(err) => {
                error!(error = %err, "knowledge graph build failed");
                if let Some(kg) = ctx.kg.take() {
                    ctx.repository
                        .mark_status(kg, KgStatus::Error, Some(err.to_string()))
                        .await?;
                }
                Err(err)
            }
        }
    }

    async fn drive(&self, ctx: &mut BuildContext<'_>) -> Result<(), KgAgentError> {
        let machine = state::ready();
        let machine = stages::insert_metadata(machine, ctx).await?;
        let machine = stages::extract(machine, ctx).await?;
        let machine = stages::enrich(machine, ctx).await?;
        let machine = stages::embed(machine, ctx).await?;
        let machine = stages::populate_index(machine, ctx).await?;
        let _machine = machine
            .finalize()
            .map_err(|(_, guard)| KgAgentError::InternalError(format!("finalize transition failed: {guard:?}")))?;
        Ok(())
    }
}
