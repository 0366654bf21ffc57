//! Public library surface: a single `Engine` wiring every component crate together and
//! exposing the five operations an external driver (CLI, HTTP service, UI) calls into.

pub mod engine;
pub mod types;

pub use engine::{Engine, KgAgentEngine};
pub use types::{
    ConnectOrBuildKgRequest, FeedbackResult, KgListItem, KgLoadResult, QueryMetadata, QueryResult,
};
