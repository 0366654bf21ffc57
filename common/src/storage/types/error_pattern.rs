use crate::stored_object;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

stored_object!(ErrorPattern, "query_error_patterns", {
    kg_id: String,
    category: String,
    description: String,
    example_error: Option<String>,
    fix_applied: Option<String>,
    affected_tables: Vec<String>,
    occurrence_count: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    is_active: bool
});

impl ErrorPattern {
    pub fn new(
        kg_id: String,
        category: String,
        description: String,
        example_error: Option<String>,
        fix_applied: Option<String>,
        affected_tables: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            kg_id,
            category,
            description,
            example_error,
            fix_applied,
            affected_tables,
            occurrence_count: 1,
            first_seen: now,
            last_seen: now,
            is_active: true,
        }
    }
}
