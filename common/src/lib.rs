pub mod error;
pub mod llm;
pub mod storage;
pub mod utils;

pub use error::KgAgentError;
pub use utils::config::{get_config, AppConfig, TargetDbConfig};
