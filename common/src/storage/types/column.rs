use crate::stored_object;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Low,
    Medium,
    High,
}

impl Cardinality {
    /// Mirrors the thresholds used during extraction: `unique < 10` is low,
    /// `unique < 0.5 * total` is medium, everything else is high.
    pub fn classify(unique_count: i64, total_count: i64) -> Self {
        if unique_count < 10 {
            Cardinality::Low
        } else if total_count > 0 && (unique_count as f64) < 0.5 * (total_count as f64) {
            Cardinality::Medium
        } else {
            Cardinality::High
        }
    }
}

stored_object!(Column, "kg_columns", {
    table_id: String,
    name: String,
    qualified_name: String,
    data_type: String,
    nullable: bool,
    is_pk: bool,
    is_unique: bool,
    is_fk: bool,
    position: i32,
    description: Option<String>,
    business_meaning: Option<String>,
    sample_values: Vec<String>,
    enum_values: Vec<String>,
    cardinality: Option<Cardinality>,
    null_pct: Option<f64>,
    is_pii: bool
});

#[allow(clippy::too_many_arguments)]
impl Column {
    pub fn new(
        table_id: String,
        name: String,
        qualified_name: String,
        data_type: String,
        nullable: bool,
        is_pk: bool,
        is_unique: bool,
        is_fk: bool,
        position: i32,
        sample_values: Vec<String>,
        enum_values: Vec<String>,
        cardinality: Option<Cardinality>,
        null_pct: Option<f64>,
        is_pii: bool,
    ) -> Self {
        let now = chrono::Utc::now();
        let id = format!("{table_id}__{name}");
        Self {
            id,
            created_at: now,
            updated_at: now,
            table_id,
            name,
            qualified_name,
            data_type,
            nullable,
            is_pk,
            is_unique,
            is_fk,
            position,
            description: None,
            business_meaning: None,
            sample_values,
            enum_values,
            cardinality,
            null_pct,
            is_pii,
        }
    }

    pub fn document(&self) -> String {
        let mut text = format!("Column: {}", self.qualified_name);
        if let Some(desc) = &self.description {
            text.push_str(&format!("\nDescription: {desc}"));
        }
        text
    }

    /// Metadata map stored alongside this column's vector-index entry.
    pub fn metadata(&self) -> serde_json::Value {
        let cardinality = match self.cardinality {
            Some(Cardinality::Low) => "low",
            Some(Cardinality::Medium) => "medium",
            Some(Cardinality::High) => "high",
            None => "",
        };
        json!({
            "entity_type": "column",
            "qualified_name": self.qualified_name,
            "column_name": self.name,
            "data_type": self.data_type,
            "is_pii": self.is_pii,
            "cardinality": cardinality,
        })
    }

    /// Whether this column is worth embedding on its own: excludes bare id/timestamp
    /// columns with no enrichment.
    pub fn is_embeddable(&self) -> bool {
        if self.description.is_none() {
            return false;
        }
        let lower = self.name.to_lowercase();
        !(lower == "id" || lower.ends_with("_at") || lower.ends_with("_id") && self.is_pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinality_thresholds() {
        assert_eq!(Cardinality::classify(5, 1000), Cardinality::Low);
        assert_eq!(Cardinality::classify(400, 1000), Cardinality::Medium);
        assert_eq!(Cardinality::classify(999, 1000), Cardinality::High);
        assert_eq!(Cardinality::classify(1000, 1000), Cardinality::High);
    }
}
