use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::KgAgentError;

/// A single structured completion request: a system prompt, a user prompt, and the
/// JSON schema the response must conform to.
pub struct StructuredRequest<'a> {
    pub schema_name: &'static str,
    pub schema_description: &'static str,
    pub schema: Value,
    pub system_prompt: &'a str,
    pub user_prompt: String,
}

/// Capability seam between the agent runtime and whatever LLM/embedding provider backs it.
/// Implemented once against an OpenAI-compatible API; a deterministic test double implements
/// the same trait for unit tests. Kept object-safe (no generics) so callers can hold it as
/// `&dyn LlmCapability`; typed access goes through [`LlmCapabilityExt`].
#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn complete_structured_json(&self, request: StructuredRequest<'_>) -> Result<Value, KgAgentError>;

    async fn embed(&self, input: &str) -> Result<Vec<f32>, KgAgentError>;

    fn embedding_dimension(&self) -> usize;
}

/// Typed convenience layer over [`LlmCapability`], blanket-implemented so it's usable
/// through `&dyn LlmCapability` the same way the object-safe methods are.
#[async_trait]
pub trait LlmCapabilityExt: LlmCapability {
    async fn complete_structured<T: DeserializeOwned + Send>(
        &self,
        request: StructuredRequest<'_>,
    ) -> Result<T, KgAgentError> {
        let value = self.complete_structured_json(request).await?;
        serde_json::from_value(value).map_err(|e| KgAgentError::LLMParsing(format!("failed to parse LLM response: {e}")))
    }
}

impl<L: LlmCapability + ?Sized> LlmCapabilityExt for L {}

pub struct OpenAiLlm {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    chat_model: String,
    embedding_model: String,
    embedding_dimension: usize,
}

impl OpenAiLlm {
    pub fn new(
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        chat_model: String,
        embedding_model: String,
        embedding_dimension: usize,
    ) -> Self {
        Self {
            client,
            chat_model,
            embedding_model,
            embedding_dimension,
        }
    }
}

#[async_trait]
impl LlmCapability for OpenAiLlm {
    async fn complete_structured_json(&self, request: StructuredRequest<'_>) -> Result<Value, KgAgentError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some(request.schema_description.to_string()),
                name: request.schema_name.to_string(),
                schema: Some(request.schema),
                strict: Some(true),
            },
        };

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .temperature(0.0)
            .messages([
                ChatCompletionRequestSystemMessage::from(request.system_prompt).into(),
                ChatCompletionRequestUserMessage::from(request.user_prompt).into(),
            ])
            .response_format(response_format)
            .build()
            .map_err(KgAgentError::OpenAI)?;

        let response = self.client.chat().create(chat_request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| KgAgentError::LLMParsing("no content in LLM response".into()))?;

        serde_json::from_str::<Value>(content)
            .map_err(|e| KgAgentError::LLMParsing(format!("failed to parse LLM response: {e}")))
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>, KgAgentError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .dimensions(self.embedding_dimension as u32)
            .input([input])
            .build()
            .map_err(KgAgentError::OpenAI)?;

        let response = self.client.embeddings().create(request).await?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| KgAgentError::LLMParsing("no embedding data received".into()))?
            .embedding;

        Ok(embedding)
    }

    fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::{KgAgentError, LlmCapability, StructuredRequest};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic stand-in for [`LlmCapability`]: returns pre-seeded JSON responses in
    /// order, and deterministic pseudo-embeddings derived from the input text length.
    pub struct FakeLlm {
        responses: Mutex<Vec<String>>,
        cursor: AtomicUsize,
        dimension: usize,
    }

    impl FakeLlm {
        pub fn new(responses: Vec<String>, dimension: usize) -> Self {
            Self {
                responses: Mutex::new(responses),
                cursor: AtomicUsize::new(0),
                dimension,
            }
        }
    }

    #[async_trait]
    impl LlmCapability for FakeLlm {
        async fn complete_structured_json(&self, _request: StructuredRequest<'_>) -> Result<Value, KgAgentError> {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let responses = self.responses.lock().map_err(|_| {
                KgAgentError::InternalError("fake llm response lock poisoned".into())
            })?;
            let raw = responses
                .get(idx)
                .ok_or_else(|| KgAgentError::LLMParsing("fake llm exhausted".into()))?;
            serde_json::from_str(raw).map_err(|e| KgAgentError::LLMParsing(format!("fake llm decode: {e}")))
        }

        async fn embed(&self, input: &str) -> Result<Vec<f32>, KgAgentError> {
            let seed = input.len() as f32;
            Ok((0..self.dimension)
                .map(|i| ((seed + i as f32).sin()))
                .collect())
        }

        fn embedding_dimension(&self) -> usize {
            self.dimension
        }
    }
}
