use crate::stored_object;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

stored_object!(ErrorSummary, "kg_error_summary", {
    kg_id: String,
    schema_lessons: String,
    sql_lessons: String,
    lesson_count: u32,
    word_count: usize,
    compression_threshold: usize,
    last_compressed_at: Option<DateTime<Utc>>,
    version: u32
});

impl ErrorSummary {
    pub fn new(kg_id: String, compression_threshold: usize) -> Self {
        let now = Utc::now();
        Self {
            id: kg_id.clone(),
            created_at: now,
            updated_at: now,
            kg_id,
            schema_lessons: String::new(),
            sql_lessons: String::new(),
            lesson_count: 0,
            word_count: 0,
            compression_threshold,
            last_compressed_at: None,
            version: 1,
        }
    }

    pub fn recompute_word_count(&mut self) {
        self.word_count = word_count(&self.schema_lessons) + word_count(&self.sql_lessons);
    }

    pub fn needs_compression(&self) -> bool {
        self.word_count >= self.compression_threshold
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_summary_starts_empty() {
        let summary = ErrorSummary::new("kg1".into(), 500);
        assert_eq!(summary.word_count, 0);
        assert!(!summary.needs_compression());
    }

    #[test]
    fn recompute_sums_both_fields() {
        let mut summary = ErrorSummary::new("kg1".into(), 10);
        summary.schema_lessons = "one two three".into();
        summary.sql_lessons = "four five".into();
        summary.recompute_word_count();
        assert_eq!(summary.word_count, 5);
        assert!(!summary.needs_compression());

        summary.schema_lessons.push_str(" six seven eight nine ten");
        summary.recompute_word_count();
        assert!(summary.needs_compression());
    }
}
