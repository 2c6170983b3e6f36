use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::utils::limiters::Limiters;
use crate::utils::resilience::{Guard, Policy};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The chat LLM seam. The orchestrator and the auxiliary agents (enricher,
/// reformulator, memory extraction, compaction) all depend on this trait,
/// never on the HTTP client.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String>;

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream>;
}

/// Extract the first balanced JSON object from possibly noisy model output,
/// respecting strings and escapes.
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    let mut start: Option<usize> = None;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if start.is_none() {
            if ch == '{' {
                start = Some(i);
                depth = 1;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start?..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

/// One structured call: complete at temperature 0 and parse the first JSON
/// object out of the reply.
pub async fn complete_json<T: DeserializeOwned>(
    model: &dyn ChatModel,
    messages: &[ChatMessage],
    max_tokens: usize,
) -> Result<T> {
    let raw = model.complete(messages, max_tokens, 0.0).await?;
    let json = extract_first_json_object(&raw)
        .ok_or_else(|| anyhow::anyhow!("no JSON object in model output"))?;
    serde_json::from_str(json).context("failed to parse structured model output")
}

// ===== OpenAI-compatible client =====

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub struct LlmService {
    client: Client,
    config: LlmConfig,
    guard: Guard,
    limiters: Arc<Limiters>,
}

impl LlmService {
    pub fn new(config: LlmConfig, limiters: Arc<Limiters>) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            guard: Guard::new(Policy::new("chat", 2, timeout)),
            config,
            limiters,
        }
    }

    async fn post_completion(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens,
            temperature,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .context("failed to reach chat LLM")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("chat LLM error ({status}): {body}");
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for LlmService {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.llm.clone(),
            self.limiters.acquire_timeout,
            "llm_complete",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_complete", "wait_queue");

        let this = self;
        let body: ChatCompletionResponse = self
            .guard
            .call(move || async move {
                let response = this
                    .post_completion(messages, max_tokens, temperature, false)
                    .await?;
                response
                    .json::<ChatCompletionResponse>()
                    .await
                    .context("failed to parse chat completion")
            })
            .await
            .map_err(anyhow::Error::from)?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat LLM returned no choices"))
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let (permit, wait) = Limiters::acquire_timed(
            self.limiters.llm.clone(),
            self.limiters.acquire_timeout,
            "llm_stream",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_stream", "wait_queue");

        let response = self
            .post_completion(messages, self.config.max_tokens, 0.7, true)
            .await?;

        // SSE deltas arrive in arbitrary byte chunks; buffer until complete
        // lines before parsing.
        let stream = async_stream::try_stream! {
            use futures::StreamExt;

            let _permit = permit; // held for the lifetime of the stream
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.context("chat stream read failed")?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                        if let Some(content) = parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_ref())
                        {
                            if !content.is_empty() {
                                yield content.clone();
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_object() {
        let raw = "Here you go: {\"a\": 1} trailing";
        assert_eq!(extract_first_json_object(raw), Some("{\"a\": 1}"));
    }

    #[test]
    fn extracts_nested_object() {
        let raw = "{\"outer\": {\"inner\": [1, 2]}}";
        assert_eq!(extract_first_json_object(raw), Some(raw));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let raw = r#"{"text": "a } brace \" inside"}"#;
        assert_eq!(extract_first_json_object(raw), Some(raw));
    }

    #[test]
    fn no_object_returns_none() {
        assert_eq!(extract_first_json_object("plain text"), None);
        assert_eq!(extract_first_json_object("{unclosed"), None);
    }

    #[tokio::test]
    async fn complete_json_parses_structured_reply() {
        struct Fixed;
        #[async_trait]
        impl ChatModel for Fixed {
            async fn complete(&self, _: &[ChatMessage], _: usize, _: f32) -> Result<String> {
                Ok("noise {\"value\": 42} noise".to_string())
            }
            async fn stream(&self, _: &[ChatMessage]) -> Result<TokenStream> {
                anyhow::bail!("not used")
            }
        }

        #[derive(Deserialize)]
        struct Out {
            value: i32,
        }

        let out: Out = complete_json(&Fixed, &[ChatMessage::user("q")], 64)
            .await
            .unwrap();
        assert_eq!(out.value, 42);
    }
}
