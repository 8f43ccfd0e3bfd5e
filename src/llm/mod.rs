//! LLM provider adapters.
//!
//! Every provider exposes the same contract: `generate` for non-streaming
//! calls returning text plus token usage, and `generate_stream` which
//! forwards text chunks to a callback and returns final usage. The worker
//! holds providers as `Arc<dyn LlmClient>` so the agentic loop, the
//! classifiers, and the schema designer are all testable against the
//! scripted double.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::errors::AgentError;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Callback receiving streamed text chunks.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The model name calls are accounted under.
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<Generation>;

    /// Streaming variant; chunks go to `sink`, the full generation (with
    /// usage) is returned at the end.
    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        sink: ChunkSink<'_>,
    ) -> Result<Generation>;
}

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic Messages API adapter.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn request_body(
        &self,
        prompt: &str,
        system: Option<&str>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system.to_string());
        }
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        }
        body
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<Generation> {
        let body = self.request_body(prompt, system, false);
        let response = self
            .request(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!("{}: {}", status, detail)).into());
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to decode LLM response")?;
        let text = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<String>();

        Ok(Generation {
            text,
            usage: Usage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        sink: ChunkSink<'_>,
    ) -> Result<Generation> {
        let body = self.request_body(prompt, system, true);
        let response = self
            .request(&body)
            .send()
            .await
            .context("LLM stream request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!("{}: {}", status, detail)).into());
        }

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("LLM stream read failed")?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // SSE frames are newline-delimited; keep the trailing partial line.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
                    continue;
                };
                match event["type"].as_str() {
                    Some("message_start") => {
                        usage.input_tokens = event["message"]["usage"]["input_tokens"]
                            .as_u64()
                            .unwrap_or(0);
                    }
                    Some("content_block_delta") => {
                        if let Some(delta) = event["delta"]["text"].as_str() {
                            text.push_str(delta);
                            sink(delta);
                        }
                    }
                    Some("message_delta") => {
                        if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                            usage.output_tokens = out;
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Generation { text, usage })
    }
}

/// Scripted test double: returns queued generations in order and records
/// every prompt it was called with.
#[derive(Default)]
pub struct ScriptedLlm {
    model: String,
    responses: Mutex<VecDeque<Generation>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedLlm {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, text: &str) {
        self.push(Generation {
            text: text.to_string(),
            usage: Usage {
                input_tokens: 1000,
                output_tokens: 500,
            },
        });
    }

    pub fn push(&self, generation: Generation) {
        self.responses.lock().unwrap().push_back(generation);
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<Generation> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), system.map(str::to_string)));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Provider("scripted LLM exhausted".into()).into())
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        sink: ChunkSink<'_>,
    ) -> Result<Generation> {
        let generation = self.generate(prompt, system).await?;
        sink(&generation.text);
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_llm_returns_in_order() {
        let llm = ScriptedLlm::new("test-model");
        llm.push_text("first");
        llm.push_text("second");

        assert_eq!(llm.generate("a", None).await.unwrap().text, "first");
        assert_eq!(llm.generate("b", Some("sys")).await.unwrap().text, "second");
        assert!(llm.generate("c", None).await.is_err());

        let calls = llm.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].1.as_deref(), Some("sys"));
    }

    #[tokio::test]
    async fn test_scripted_stream_forwards_one_chunk() {
        let llm = ScriptedLlm::new("test-model");
        llm.push_text("streamed");
        let chunks = Mutex::new(Vec::new());
        let generation = llm
            .generate_stream("p", None, &|c| chunks.lock().unwrap().push(c.to_string()))
            .await
            .unwrap();
        assert_eq!(generation.text, "streamed");
        assert_eq!(chunks.into_inner().unwrap(), vec!["streamed"]);
    }

    #[test]
    fn test_request_body_shape() {
        let client = AnthropicClient::new("key", "claude-sonnet-4-20250514");
        let body = client.request_body("hi", Some("be terse"), false);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["system"], "be terse");
        assert!(body.get("stream").is_none());
    }
}
