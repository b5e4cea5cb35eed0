use super::errors::AssistantError;
use super::functions::FunctionSchema;
use super::models::{ChatMessage, FunctionCall, TokenUsage};
use async_trait::async_trait;

/// Which endpoint and key a request should use. Empty fields fall back to the
/// provider's global defaults.
#[derive(Debug, Clone, Default)]
pub struct EndpointConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub functions: Vec<FunctionSchema>,
    pub temperature: f32,
    /// None lets the model decide.
    pub max_tokens: Option<u32>,
}

/// What came back from a chat completion: text, function calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub content: Option<String>,
    pub function_calls: Vec<FunctionCall>,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingReply {
    pub vector: Vec<f32>,
    pub model: String,
    pub usage: TokenUsage,
}

/// An LLM vendor. Implemented in infra; mocked in tests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat_complete(
        &self,
        request: &ChatRequest,
        endpoint: &EndpointConfig,
    ) -> Result<ChatReply, AssistantError>;

    async fn embed(
        &self,
        text: &str,
        endpoint: &EndpointConfig,
    ) -> Result<EmbeddingReply, AssistantError>;

    /// True when requests without a per-guild key still have somewhere to go.
    fn has_global_endpoint(&self) -> bool;
}
