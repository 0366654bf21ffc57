pub mod error_router;
pub mod executor_validator;
pub mod schema_selector;
pub mod sql_generator;
pub mod state;

pub use error_router::ErrorRouter;
pub use executor_validator::ExecutorValidator;
pub use schema_selector::SchemaSelector;
pub use sql_generator::SqlGenerator;
pub use state::{AgentState, ErrorInfo, ExecutionResult, RouteTo};
