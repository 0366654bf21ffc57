use std::sync::Arc;

use serde_json::Value;

/// One reported step of a build run. Mirrors the teacher's span-per-stage `info!`/`debug!`
/// instrumentation, surfaced as a structured value so a caller (CLI, API) can render progress
/// without scraping logs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub stage: &'static str,
    pub message: String,
    pub progress: f32,
    pub details: Option<Value>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

pub fn emit(callback: &Option<ProgressCallback>, stage: &'static str, message: impl Into<String>, progress: f32) {
    if let Some(callback) = callback {
        callback(ProgressEvent {
            stage,
            message: message.into(),
            progress,
            details: None,
        });
    }
}

pub fn emit_with_details(
    callback: &Option<ProgressCallback>,
    stage: &'static str,
    message: impl Into<String>,
    progress: f32,
    details: Value,
) {
    if let Some(callback) = callback {
        callback(ProgressEvent {
            stage,
            message: message.into(),
            progress,
            details: Some(details),
        });
    }
}
