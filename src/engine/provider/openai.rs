//! OpenAI-compatible HTTP provider (`/chat/completions` + `/embeddings`).
//!
//! Works against OpenAI itself and the many servers that mirror its wire
//! format (Ollama, LM Studio, vLLM, LiteLLM proxies).

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::engine::types::{
    ChatCompletion, ChatMessage, ChatOptions, FinishReason, ModelRef, Role, ToolCall, ToolSpec,
};
use crate::error::AppError;

use super::ModelProvider;

/// Model-id fragments known to accept image input.
const VISION_MODEL_HINTS: &[&str] = &[
    "gpt-4o", "gpt-4.1", "gpt-5", "vision", "claude-3", "claude-sonnet", "claude-opus",
    "gemini", "llava", "pixtral", "qwen-vl", "qwen2.5-vl",
];

/// Convert any displayable error into `AppError::Provider`.
fn provider_err(e: impl std::fmt::Display) -> AppError {
    AppError::Provider(e.to_string())
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ============================================================================
// OpenAiProvider
// ============================================================================

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    organization: Option<String>,
}

impl OpenAiProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(provider_err)?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            organization: settings.organization.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org);
        }
        req
    }

    /// Send a request, surface non-2xx bodies, and deserialize the JSON response.
    async fn send_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T, AppError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Provider("Request timed out".into())
            } else {
                provider_err(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            return Err(AppError::Provider(format!("HTTP {status}: {snippet}")));
        }

        resp.json().await.map_err(provider_err)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn chat_complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, AppError> {
        let body = build_chat_body(messages, options);
        let req = self
            .post("/chat/completions")
            .timeout(Duration::from_millis(options.time_limit_ms))
            .json(&body);

        tracing::debug!(model = %options.model, messages = messages.len(), tools = options.tools.len(), "chat_complete");

        let response: ChatResponse = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Aborted("Model call cancelled".into()));
            }
            res = Self::send_json(req) => res?,
        };

        parse_chat_response(response)
    }

    async fn embed(&self, text: &str, model: &ModelRef) -> Result<Vec<f32>, AppError> {
        let req = self
            .post("/embeddings")
            .timeout(Duration::from_secs(60))
            .json(&json!({ "model": model.id, "input": text }));

        let response: EmbeddingResponse = Self::send_json(req)
            .await
            .map_err(|e| AppError::Embedding(e.to_string()))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Embedding("Empty embedding response".into()))
    }

    fn supports_vision(&self, model: &ModelRef) -> bool {
        let id = model.id.to_lowercase();
        VISION_MODEL_HINTS.iter().any(|hint| id.contains(hint))
    }
}

// ============================================================================
// Wire conversion
// ============================================================================

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(msg: &ChatMessage) -> Value {
    let mut wire = json!({ "role": role_str(msg.role) });

    if msg.images.is_empty() {
        wire["content"] = Value::String(msg.content.clone());
    } else {
        let mut parts = vec![json!({ "type": "text", "text": msg.content })];
        parts.extend(
            msg.images
                .iter()
                .map(|img| json!({ "type": "image_url", "image_url": { "url": img.as_url() } })),
        );
        wire["content"] = Value::Array(parts);
    }

    if !msg.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments.to_string() },
                    })
                })
                .collect(),
        );
    }

    if let Some(ref id) = msg.tool_call_id {
        wire["tool_call_id"] = Value::String(id.clone());
    }
    wire
}

fn tool_to_wire(tool: &ToolSpec) -> Value {
    let parameters = if tool.parameters.is_null() {
        json!({ "type": "object", "properties": {} })
    } else {
        tool.parameters.clone()
    };
    json!({
        "type": "function",
        "function": { "name": tool.name, "description": tool.description, "parameters": parameters },
    })
}

fn build_chat_body(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut body = json!({
        "model": options.model.id,
        "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
        "max_tokens": options.max_tokens,
        "temperature": options.temperature,
    });
    if !options.tools.is_empty() {
        body["tools"] = Value::Array(options.tools.iter().map(tool_to_wire).collect());
    }
    if options.json {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

fn parse_chat_response(response: ChatResponse) -> Result<ChatCompletion, AppError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Provider("Response contained no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            // Models occasionally emit malformed argument JSON; keep the raw text.
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments)),
        })
        .collect();

    Ok(ChatCompletion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ImageInput;

    fn options(tools: Vec<ToolSpec>, json_mode: bool) -> ChatOptions {
        ChatOptions {
            model: ModelRef::new("openai", "gpt-4o-mini"),
            tools,
            max_tokens: 256,
            time_limit_ms: 5_000,
            temperature: 0.0,
            json: json_mode,
        }
    }

    #[test]
    fn test_body_with_tools_and_json_mode() {
        let tools = vec![ToolSpec {
            name: "search".into(),
            description: "Web search".into(),
            parameters: Value::Null,
        }];
        let body = build_chat_body(&[ChatMessage::system("sys"), ChatMessage::user("hi")], &options(tools, true));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_image_message_uses_content_parts() {
        let mut msg = ChatMessage::user("what is this?");
        msg.images.push(ImageInput {
            name: "cat.png".into(),
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        });
        let wire = message_to_wire(&msg);
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_tool_round_trip_messages() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "search".into(),
            arguments: json!({ "q": "rust" }),
        };
        let assistant = message_to_wire(&ChatMessage::assistant_tool_calls("", vec![call]));
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], r#"{"q":"rust"}"#);

        let tool = message_to_wire(&ChatMessage::tool_result("call_1", "3 results"));
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "call_1");
    }

    #[test]
    fn test_parse_response_with_tool_calls() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        { "id": "a", "function": { "name": "search", "arguments": "{\"q\":\"x\"}" } },
                        { "id": "b", "function": { "name": "broken", "arguments": "{oops" } }
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let parsed = parse_chat_response(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(parsed.text, "");
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.tool_calls[0].arguments["q"], "x");
        assert_eq!(parsed.tool_calls[1].arguments, Value::String("{oops".into()));
    }

    #[test]
    fn test_parse_response_without_choices() {
        let raw = json!({ "choices": [] });
        assert!(parse_chat_response(serde_json::from_value(raw).unwrap()).is_err());
    }

    #[test]
    fn test_vision_hints() {
        let provider = OpenAiProvider::new(&ProviderSettings::default()).unwrap();
        assert!(provider.supports_vision(&ModelRef::new("openai", "gpt-4o-mini")));
        assert!(!provider.supports_vision(&ModelRef::new("openai", "gpt-3.5-turbo")));
    }
}
