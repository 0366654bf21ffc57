use crate::stored_object;
use serde::{Deserialize, Serialize};

stored_object!(QueryLog, "kg_query_log", {
    kg_id: String,
    user_question: String,
    refined_question: Option<String>,
    selected_tables: Vec<String>,
    generated_sql: Option<String>,
    success: bool,
    execution_time_ms: Option<u64>,
    error_message: Option<String>,
    error_category: Option<String>,
    correction_summary: Option<String>,
    tables_used: Vec<String>,
    iterations: u32,
    confidence: Option<f64>,
    query_embedding: Option<Vec<f32>>,
    user_feedback: Option<String>,
    feedback_rating: Option<u8>
});

impl QueryLog {
    pub fn new(kg_id: String, user_question: String) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kg_id,
            user_question,
            refined_question: None,
            selected_tables: Vec::new(),
            generated_sql: None,
            success: false,
            execution_time_ms: None,
            error_message: None,
            error_category: None,
            correction_summary: None,
            tables_used: Vec::new(),
            iterations: 0,
            confidence: None,
            query_embedding: None,
            user_feedback: None,
            feedback_rating: None,
        }
    }
}
