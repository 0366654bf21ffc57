use common::utils::config::get_config;
use main::{Engine, KgAgentEngine};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let engine = Engine::new(config).await?;

    let kgs = engine.list_kgs().await?;
    info!(count = kgs.len(), "known knowledge graphs");
    for kg in &kgs {
        info!(kg_id = %kg.kg_id, database = %kg.database_name, status = ?kg.status, "kg");
    }

    if kgs.is_empty() {
        info!("no knowledge graphs registered yet; connect one via Engine::connect_or_build_kg");
    }

    Ok(())
}
