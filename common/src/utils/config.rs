use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Connection parameters for the relational database a knowledge graph describes.
#[derive(Clone, Deserialize, Debug)]
pub struct TargetDbConfig {
    pub kg_host: String,
    #[serde(default = "default_kg_port")]
    pub kg_port: u16,
    pub kg_database: String,
    pub kg_user: String,
    pub kg_password: String,
}

fn default_kg_port() -> u16 {
    5432
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub openai_chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub openai_embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    /// Address of the embedded/remote store backing both the KG metadata tables and the
    /// vector index (one engine serves both, see the vector-index design notes).
    #[serde(default = "default_vector_store_address")]
    pub vector_store_address: String,
    #[serde(default = "default_store_namespace")]
    pub store_namespace: String,
    #[serde(default = "default_store_database")]
    pub store_database: String,
    #[serde(default)]
    pub store_username: String,
    #[serde(default)]
    pub store_password: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_row_limit_cap")]
    pub row_limit_cap: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    pub kg_host: Option<String>,
    #[serde(default = "default_kg_port")]
    pub kg_port: u16,
    pub kg_database: Option<String>,
    pub kg_user: Option<String>,
    pub kg_password: Option<String>,
}

impl AppConfig {
    /// Build the default target-database connection from the bundled `KG_*` env vars, when
    /// all of them are present. Callers of the public API may pass explicit connection
    /// parameters instead, in which case this default is unused.
    pub fn default_target_db(&self) -> Option<TargetDbConfig> {
        Some(TargetDbConfig {
            kg_host: self.kg_host.clone()?,
            kg_port: self.kg_port,
            kg_database: self.kg_database.clone()?,
            kg_user: self.kg_user.clone()?,
            kg_password: self.kg_password.clone()?,
        })
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_vector_store_address() -> String {
    "mem://".to_string()
}

fn default_store_namespace() -> String {
    "kg_agent".to_string()
}

fn default_store_database() -> String {
    "kg_agent".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_row_limit_cap() -> u64 {
    10_000
}

fn default_statement_timeout_secs() -> u64 {
    30
}

fn default_compression_threshold() -> usize {
    500
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
