use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum KgAgentError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Target database error: {0}")]
    TargetDb(#[from] sqlx::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("KG not found: {0}")]
    KgNotFound(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Needs clarification: {0}")]
    NeedsClarification(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl KgAgentError {
    /// Best-effort mapping onto the caller-visible error taxonomy used in `QueryResult`.
    pub fn category(&self) -> &'static str {
        match self {
            Self::KgNotFound(_) => "kg_not_found",
            Self::Database(_) => "connection_error",
            Self::TargetDb(_) => "connection_error",
            Self::NeedsClarification(_) => "needs_clarification",
            Self::OpenAI(_) | Self::LLMParsing(_) => "system_error",
            Self::Join(_) | Self::Io(_) | Self::Anyhow(_) | Self::InternalError(_) => {
                "system_error"
            }
            Self::NotFound(_) | Self::Validation(_) => "execution_error",
        }
    }
}
