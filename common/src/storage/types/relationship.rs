use crate::stored_object;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    OneToOne,
    ManyToOne,
}

stored_object!(Relationship, "kg_relationships", {
    kg_id: String,
    from_table_id: String,
    to_table_id: String,
    from_column: String,
    to_column: String,
    relationship_type: RelationshipType,
    join_condition: String,
    is_self_reference: bool,
    constraint_name: Option<String>
});

#[allow(clippy::too_many_arguments)]
impl Relationship {
    pub fn new(
        kg_id: String,
        from_table_id: String,
        to_table_id: String,
        from_column: String,
        to_column: String,
        relationship_type: RelationshipType,
        join_condition: String,
        is_self_reference: bool,
        constraint_name: Option<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        let id = format!(
            "{kg_id}__{}",
            constraint_name
                .clone()
                .unwrap_or_else(|| format!("{from_table_id}_{from_column}_{to_table_id}_{to_column}"))
        );
        Self {
            id,
            created_at: now,
            updated_at: now,
            kg_id,
            from_table_id,
            to_table_id,
            from_column,
            to_column,
            relationship_type,
            join_condition,
            is_self_reference,
            constraint_name,
        }
    }
}
