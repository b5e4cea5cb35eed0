use crate::core::assistant::functions::FunctionSchema;
use crate::core::assistant::models::{ChatMessage, FunctionCall, Role, TokenUsage};
use crate::core::assistant::provider::{ChatReply, ChatRequest, EmbeddingReply, EndpointConfig};
use crate::core::assistant::{AssistantError, ChatProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBED_MODEL: &str = "text-embedding-3-small";

/// Client for any OpenAI-compatible `/chat/completions` + `/embeddings` API.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    embed_model: String,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        embed_model: Option<String>,
    ) -> Result<Self, AssistantError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent("AssistantBot/1.0")
            .build()
            .map_err(|e| AssistantError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            embed_model: embed_model.unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string()),
        })
    }

    fn url(&self, endpoint: &EndpointConfig, path: &str) -> String {
        let base = endpoint.base_url.as_deref().unwrap_or(&self.base_url);
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    async fn post(&self, endpoint: &EndpointConfig, path: &str, payload: &Value) -> Result<Value, AssistantError> {
        let mut request = self.client.post(self.url(endpoint, path)).json(payload);
        if let Some(key) = endpoint.api_key.as_ref().or(self.api_key.as_ref()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| AssistantError::MalformedResponse(e.to_string()))
    }
}

fn map_transport_error(err: reqwest::Error) -> AssistantError {
    if err.is_timeout() {
        AssistantError::Timeout(err.to_string())
    } else {
        AssistantError::Connection(err.to_string())
    }
}

/// Pulls `error.message` out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

pub fn map_status(status: StatusCode, body: &str) -> AssistantError {
    let message = error_message(body);
    match status.as_u16() {
        401 | 403 => AssistantError::Authentication(message),
        429 => AssistantError::RateLimited(message),
        code if status.is_server_error() => AssistantError::ServerError {
            status: code,
            message,
        },
        code => AssistantError::InvalidRequest {
            status: code,
            message,
        },
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

/// Tool-style calls go out as `tool_calls`, legacy ones as `function_call`.
pub fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({ "role": message.role.as_str() });

    if message.function_calls.is_empty() || !message.content.is_empty() {
        wire["content"] = json!(message.content);
    } else {
        wire["content"] = Value::Null;
    }
    if let Some(name) = &message.name {
        // Tool results are matched by id and don't take a name
        if message.role != Role::Tool {
            wire["name"] = json!(name);
        }
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }

    let (tool_calls, legacy): (Vec<&FunctionCall>, Vec<&FunctionCall>) =
        message.function_calls.iter().partition(|c| c.id.is_some());
    if !tool_calls.is_empty() {
        let calls: Vec<WireToolCall> = tool_calls
            .iter()
            .map(|c| WireToolCall {
                id: c.id.as_deref().unwrap_or_default(),
                kind: "function",
                function: WireFunction {
                    name: &c.name,
                    arguments: &c.arguments,
                },
            })
            .collect();
        wire["tool_calls"] = json!(calls);
    } else if let Some(call) = legacy.first() {
        wire["function_call"] = json!(WireFunction {
            name: &call.name,
            arguments: &call.arguments,
        });
    }
    wire
}

pub fn chat_payload(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
    let mut payload = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
    });
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if !request.functions.is_empty() {
        let tools: Vec<Value> = request
            .functions
            .iter()
            .map(|f: &FunctionSchema| json!({"type": "function", "function": f}))
            .collect();
        payload["tools"] = json!(tools);
    }
    payload
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage {
            total: usage.total_tokens,
            prompt: usage.prompt_tokens,
            completion: usage.completion_tokens,
        }
    }
}

#[derive(Deserialize)]
struct WireCalledFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireReturnedToolCall {
    id: String,
    function: WireCalledFunction,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireReturnedToolCall>,
    function_call: Option<WireCalledFunction>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

pub fn parse_chat_response(body: Value) -> Result<ChatReply, AssistantError> {
    let response: WireChatResponse =
        serde_json::from_value(body).map_err(|e| AssistantError::MalformedResponse(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AssistantError::MalformedResponse("response has no choices".to_string()))?;

    let mut function_calls: Vec<FunctionCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| FunctionCall {
            id: Some(c.id),
            name: c.function.name,
            arguments: c.function.arguments,
        })
        .collect();
    if let Some(call) = choice.message.function_call {
        function_calls.push(FunctionCall {
            id: None,
            name: call.name,
            arguments: call.arguments,
        });
    }

    Ok(ChatReply {
        content: choice.message.content,
        function_calls,
        model: response.model,
        usage: response.usage.map(TokenUsage::from).unwrap_or_default(),
    })
}

#[derive(Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbedding>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

pub fn parse_embedding_response(body: Value) -> Result<EmbeddingReply, AssistantError> {
    let response: WireEmbeddingResponse =
        serde_json::from_value(body).map_err(|e| AssistantError::MalformedResponse(e.to_string()))?;
    let vector = response
        .data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| AssistantError::MalformedResponse("response has no embedding".to_string()))?;

    Ok(EmbeddingReply {
        vector,
        model: response.model,
        usage: response.usage.map(TokenUsage::from).unwrap_or_default(),
    })
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat_complete(
        &self,
        request: &ChatRequest,
        endpoint: &EndpointConfig,
    ) -> Result<ChatReply, AssistantError> {
        let payload = chat_payload(request);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            functions = request.functions.len(),
            "Sending chat completion"
        );
        let body = self.post(endpoint, "chat/completions", &payload).await?;
        parse_chat_response(body)
    }

    async fn embed(
        &self,
        text: &str,
        endpoint: &EndpointConfig,
    ) -> Result<EmbeddingReply, AssistantError> {
        let payload = json!({ "model": self.embed_model, "input": text });
        let body = self.post(endpoint, "embeddings", &payload).await?;
        parse_embedding_response(body)
    }

    fn has_global_endpoint(&self) -> bool {
        self.api_key.is_some() || self.base_url != DEFAULT_BASE_URL
    }
}
