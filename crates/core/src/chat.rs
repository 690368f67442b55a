use crate::error::ProviderError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Token deltas as they arrive from a model. Dropping the receiver cancels
/// the producing task: its next send fails and it returns without side
/// effects.
pub type TokenStream = mpsc::Receiver<Result<String, ProviderError>>;

const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            user: user.into(),
            temperature: 0.3,
            max_tokens: 2000,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// A backend that streams token-by-token completions. Backends declare their
/// model identifiers and availability; selection is explicit per request.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;

    fn models(&self) -> Vec<String>;

    fn default_model(&self) -> &str;

    fn available(&self) -> bool;

    async fn stream_completion(&self, request: ChatRequest) -> Result<TokenStream, ProviderError>;
}

/// Accumulates raw response bytes and yields complete SSE `data:` payloads.
#[derive(Default)]
struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim();
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() {
                    payloads.push(payload.to_string());
                }
            }
        }
        payloads
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub const OPENAI_CHAT_ID: &str = "openai";

pub struct OpenAiChat {
    api_key: Option<String>,
    endpoint: String,
    client: Client,
}

impl OpenAiChat {
    pub fn from_env() -> Self {
        Self {
            api_key: read_env_key("OPENAI_API_KEY"),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            client: Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    fn id(&self) -> &str {
        OPENAI_CHAT_ID
    }

    fn models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4o-mini", "gpt-4-turbo"]
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    fn default_model(&self) -> &str {
        "gpt-4o-mini"
    }

    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn stream_completion(&self, request: ChatRequest) -> Result<TokenStream, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("OPENAI_API_KEY not set".to_string()))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "model": request.model,
                "messages": messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "stream": true,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut buffer = SseBuffer::default();
            let mut bytes = response.bytes_stream();

            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(error) => {
                        let _ = tx.send(Err(ProviderError::Stream(error.to_string()))).await;
                        return;
                    }
                };

                for payload in buffer.push(&String::from_utf8_lossy(&piece)) {
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Some(delta) = openai_delta(&payload) {
                        if tx.send(Ok(delta)).await.is_err() {
                            // Receiver dropped: caller cancelled the stream.
                            return;
                        }
                    }
                }
            }

            // EOF without the [DONE] marker means the answer was truncated.
            let _ = tx
                .send(Err(ProviderError::Stream(
                    "stream ended before completion marker".to_string(),
                )))
                .await;
        });

        Ok(rx)
    }
}

fn openai_delta(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|delta| !delta.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub const ANTHROPIC_CHAT_ID: &str = "anthropic";

pub struct AnthropicChat {
    api_key: Option<String>,
    endpoint: String,
    client: Client,
}

impl AnthropicChat {
    pub fn from_env() -> Self {
        Self {
            api_key: read_env_key("ANTHROPIC_API_KEY"),
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            client: Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ChatProvider for AnthropicChat {
    fn id(&self) -> &str {
        ANTHROPIC_CHAT_ID
    }

    fn models(&self) -> Vec<String> {
        [
            "claude-3-5-sonnet-20241022",
            "claude-3-opus-20240229",
            "claude-3-haiku-20240307",
        ]
        .iter()
        .map(|m| m.to_string())
        .collect()
    }

    fn default_model(&self) -> &str {
        "claude-3-5-sonnet-20241022"
    }

    fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn stream_completion(&self, request: ChatRequest) -> Result<TokenStream, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("ANTHROPIC_API_KEY not set".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|_| ProviderError::Permanent("invalid Anthropic API key".to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{
                "role": "user",
                "content": [{ "type": "text", "text": request.user }],
            }],
            "stream": true,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, detail));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut buffer = SseBuffer::default();
            let mut bytes = response.bytes_stream();

            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(error) => {
                        let _ = tx.send(Err(ProviderError::Stream(error.to_string()))).await;
                        return;
                    }
                };

                for payload in buffer.push(&String::from_utf8_lossy(&piece)) {
                    match anthropic_event(&payload) {
                        AnthropicEvent::Delta(delta) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        AnthropicEvent::Stop => return,
                        AnthropicEvent::Error(message) => {
                            let _ = tx.send(Err(ProviderError::Stream(message))).await;
                            return;
                        }
                        AnthropicEvent::Ignore => {}
                    }
                }
            }

            // EOF without message_stop means the answer was truncated.
            let _ = tx
                .send(Err(ProviderError::Stream(
                    "stream ended before message_stop".to_string(),
                )))
                .await;
        });

        Ok(rx)
    }
}

enum AnthropicEvent {
    Delta(String),
    Stop,
    Error(String),
    Ignore,
}

fn anthropic_event(payload: &str) -> AnthropicEvent {
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return AnthropicEvent::Ignore,
    };

    match value.pointer("/type").and_then(Value::as_str) {
        Some("content_block_delta") => value
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(|text| AnthropicEvent::Delta(text.to_string()))
            .unwrap_or(AnthropicEvent::Ignore),
        Some("message_stop") => AnthropicEvent::Stop,
        Some("error") => AnthropicEvent::Error(
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("provider stream error")
                .to_string(),
        ),
        _ => AnthropicEvent::Ignore,
    }
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

pub const SCRIPTED_CHAT_ID: &str = "scripted";

/// Streams a fixed response, word by word. Used in tests and offline demos
/// where no vendor credentials exist.
#[derive(Debug, Clone)]
pub struct ScriptedChat {
    response: String,
}

impl ScriptedChat {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

impl Default for ScriptedChat {
    fn default() -> Self {
        Self::new(
            "===SUMMARY_START===\n\
             This page walks through its topic step by step, in plain language.\n\
             ===SUMMARY_END===\n\
             ===KEY_TERMS_START===\n\
             overview\n\
             ===KEY_TERMS_END===",
        )
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    fn id(&self) -> &str {
        SCRIPTED_CHAT_ID
    }

    fn models(&self) -> Vec<String> {
        vec!["scripted-1".to_string()]
    }

    fn default_model(&self) -> &str {
        "scripted-1"
    }

    fn available(&self) -> bool {
        true
    }

    async fn stream_completion(&self, _request: ChatRequest) -> Result<TokenStream, ProviderError> {
        let response = self.response.clone();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            for token in response.split_inclusive(' ') {
                if tx.send(Ok(token.to_string())).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatProviderInfo {
    pub id: String,
    pub available: bool,
    pub models: Vec<String>,
    pub default_model: String,
}

/// Runtime registry of chat backends keyed by provider id.
#[derive(Default, Clone)]
pub struct ChatRegistry {
    providers: BTreeMap<String, Arc<dyn ChatProvider>>,
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard backends: OpenAI and Anthropic
    /// (credential-gated) plus the scripted offline backend.
    pub fn with_standard_providers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiChat::from_env()));
        registry.register(Arc::new(AnthropicChat::from_env()));
        registry.register(Arc::new(ScriptedChat::default()));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))
    }

    pub fn list(&self) -> Vec<ChatProviderInfo> {
        self.providers
            .values()
            .map(|provider| ChatProviderInfo {
                id: provider.id().to_string(),
                available: provider.available(),
                models: provider.models(),
                default_model: provider.default_model().to_string(),
            })
            .collect()
    }
}

/// Drain a token stream into the full completion text. Fails on the first
/// mid-stream error.
pub async fn collect_completion(mut stream: TokenStream) -> Result<String, ProviderError> {
    let mut full = String::new();
    while let Some(delta) = stream.recv().await {
        full.push_str(&delta?);
    }
    Ok(full)
}

fn read_env_key(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_yields_complete_data_lines() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push("data: {\"a\":").is_empty());
        let payloads = buffer.push("1}\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn sse_buffer_skips_comment_and_event_lines() {
        let mut buffer = SseBuffer::default();
        let payloads = buffer.push(": keepalive\nevent: message_start\ndata: {\"x\":2}\n");
        assert_eq!(payloads, vec!["{\"x\":2}"]);
    }

    #[test]
    fn openai_delta_extracts_content() {
        let payload = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(openai_delta(payload), Some("Hel".to_string()));
        assert_eq!(openai_delta(r#"{"choices":[{"delta":{}}]}"#), None);
    }

    #[test]
    fn anthropic_events_are_classified() {
        let delta = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#;
        assert!(matches!(anthropic_event(delta), AnthropicEvent::Delta(t) if t == "Hi"));
        assert!(matches!(
            anthropic_event(r#"{"type":"message_stop"}"#),
            AnthropicEvent::Stop
        ));
        assert!(matches!(
            anthropic_event(r#"{"type":"error","error":{"message":"overloaded"}}"#),
            AnthropicEvent::Error(m) if m == "overloaded"
        ));
        assert!(matches!(
            anthropic_event(r#"{"type":"ping"}"#),
            AnthropicEvent::Ignore
        ));
    }

    #[tokio::test]
    async fn scripted_chat_streams_the_whole_response() {
        let provider = ScriptedChat::new("one two three");
        let stream = provider
            .stream_completion(ChatRequest::new("scripted-1", "ignored"))
            .await
            .unwrap();
        let full = collect_completion(stream).await.unwrap();
        assert_eq!(full, "one two three");
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_the_scripted_stream() {
        let provider = ScriptedChat::new(&"token ".repeat(10_000));
        let stream = provider
            .stream_completion(ChatRequest::new("scripted-1", "ignored"))
            .await
            .unwrap();
        drop(stream);
        // Nothing to assert beyond not hanging: the producer task exits on
        // its first failed send.
    }

    #[test]
    fn registry_lists_scripted_as_available() {
        let registry = ChatRegistry::with_standard_providers();
        let info = registry.list();
        let scripted = info.iter().find(|p| p.id == SCRIPTED_CHAT_ID).unwrap();
        assert!(scripted.available);
        assert_eq!(scripted.default_model, "scripted-1");
    }
}
