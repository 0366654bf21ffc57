use crate::stored_object;
use serde::{Deserialize, Serialize};
use serde_json::json;

stored_object!(Table, "kg_tables", {
    kg_id: String,
    name: String,
    schema_namespace: String,
    qualified_name: String,
    row_count_estimate: Option<i64>,
    description: Option<String>,
    business_domain: Option<String>,
    typical_use_cases: Vec<String>
});

impl Table {
    pub fn new(kg_id: String, name: String, schema_namespace: String, row_count_estimate: Option<i64>) -> Self {
        let now = chrono::Utc::now();
        let qualified_name = format!("{schema_namespace}.{name}");
        let id = format!("{kg_id}__{qualified_name}").replace('.', "_");
        Self {
            id,
            created_at: now,
            updated_at: now,
            kg_id,
            name,
            schema_namespace,
            qualified_name,
            row_count_estimate,
            description: None,
            business_domain: None,
            typical_use_cases: Vec::new(),
        }
    }

    pub fn document(&self) -> String {
        let mut text = format!("Table: {}", self.name);
        if let Some(desc) = &self.description {
            text.push_str(&format!("\nDescription: {desc}"));
        }
        if let Some(domain) = &self.business_domain {
            text.push_str(&format!("\nDomain: {domain}"));
        }
        text
    }

    /// Metadata map stored alongside this table's vector-index entry.
    pub fn metadata(&self) -> serde_json::Value {
        json!({
            "entity_type": "table",
            "table_name": self.name,
            "qualified_name": self.qualified_name,
            "schema_namespace": self.schema_namespace,
            "business_domain": self.business_domain.clone().unwrap_or_default(),
            "row_count": self.row_count_estimate.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_includes_optional_sections_only_when_present() {
        let mut table = Table {
            id: "t1".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            kg_id: "kg1".into(),
            name: "customers".into(),
            schema_namespace: "public".into(),
            qualified_name: "public.customers".into(),
            row_count_estimate: Some(100),
            description: None,
            business_domain: None,
            typical_use_cases: vec![],
        };
        assert_eq!(table.document(), "Table: customers");

        table.description = Some("holds customer records".into());
        assert_eq!(
            table.document(),
            "Table: customers\nDescription: holds customer records"
        );

        table.business_domain = Some("sales".into());
        assert_eq!(
            table.document(),
            "Table: customers\nDescription: holds customer records\nDomain: sales"
        );
    }
}
