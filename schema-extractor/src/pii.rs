use common::llm::{LlmCapability, LlmCapabilityExt, StructuredRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const PII_KEYWORDS: &[&str] = &[
    "email",
    "phone",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "password",
    "address",
    "dob",
    "date_of_birth",
    "passport",
    "license",
];

#[derive(Debug, Deserialize)]
struct PiiClassification {
    is_pii: bool,
    #[allow(dead_code)]
    reasoning: String,
}

fn heuristic(column_name: &str) -> bool {
    let lower = column_name.to_lowercase();
    PII_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Heuristic keyword match first; when an LLM is available its structured classification
/// overrides the heuristic, since the keyword list alone misses e.g. obfuscated names.
pub async fn detect(
    column_name: &str,
    data_type: &str,
    sample_values: &[String],
    llm: Option<&dyn LlmCapability>,
) -> bool {
    let heuristic_guess = heuristic(column_name);

    let Some(llm) = llm else {
        return heuristic_guess;
    };

    let request = StructuredRequest {
        schema_name: "pii_detection",
        schema_description: "Whether a database column holds personally identifiable information",
        schema: json!({
            "type": "object",
            "properties": {
                "is_pii": {"type": "boolean"},
                "reasoning": {"type": "string"}
            },
            "required": ["is_pii", "reasoning"],
            "additionalProperties": false
        }),
        system_prompt: "You classify whether a database column contains personally identifiable information (PII), given its name, data type, and sample values.",
        user_prompt: format!(
            "Column name: {column_name}\nData type: {data_type}\nSample values: {:?}",
            sample_values
        ),
    };

    match llm.complete_structured::<PiiClassification>(request).await {
        Ok(classification) => classification.is_pii,
        Err(err) => {
            warn!(column = column_name, error = %err, "PII classification fell back to heuristic");
            heuristic_guess
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_only_without_llm() {
        assert!(detect("email_address", "text", &[], None).await);
        assert!(!detect("created_at", "timestamp", &[], None).await);
    }
}
