use crate::stored_object;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KgStatus {
    Building,
    Ready,
    Error,
}

stored_object!(KnowledgeGraph, "kg_metadata", {
    source_fingerprint: String,
    host: String,
    port: u16,
    database_name: String,
    schema_namespace: String,
    status: KgStatus,
    version: u32,
    error_message: Option<String>
});

impl KnowledgeGraph {
    pub fn fingerprint(host: &str, port: u16, database_name: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update(port.to_be_bytes());
        hasher.update(database_name.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn new(host: String, port: u16, database_name: String, schema_namespace: String) -> Self {
        let now = chrono::Utc::now();
        let source_fingerprint = Self::fingerprint(&host, port, &database_name);
        Self {
            id: source_fingerprint.clone(),
            created_at: now,
            updated_at: now,
            source_fingerprint,
            host,
            port,
            database_name,
            schema_namespace,
            status: KgStatus::Building,
            version: 1,
            error_message: None,
        }
    }
}
