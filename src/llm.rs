//! LLM client: chat-style completion against an OpenAI-compatible endpoint.
//!
//! The orchestrator talks to the model through the [`LanguageModel`] trait so
//! that tests can substitute scripted completions. The production
//! implementation, [`LlmClient`], sends `/chat/completions` requests with
//! reqwest, parses SSE responses with `eventsource-stream`, and retries
//! transient failures with exponential backoff (10 attempts). A call that
//! survives the retries fails with [`Error::Transport`], which the
//! orchestrator surfaces as a terminal error.
//!
//! Token estimation uses the cl100k BPE. Counts are within roughly ±10% of
//! the production model family's tokenizer; the same encoder instance is used
//! for the whole task so the estimate is at least stable.

use crate::config::LlmSettings;
use crate::retry::{is_retryable_error, retry_with_backoff, RetryConfig};
use crate::types::{Completion, Message, OpenAIChunk, OpenAIRequest, OpenAIResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use std::time::Duration;
use tiktoken_rs::CoreBPE;
use tokio::sync::mpsc;

/// The seam between the orchestrator and the completion endpoint.
///
/// Implementations must never drop a message silently: either the full
/// completion is returned or the call fails.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a full completion for the conversation.
    async fn generate(&self, messages: &[Message], max_tokens: u32) -> Result<Completion>;

    /// Generate a completion, forwarding text deltas to `chunks` as they
    /// arrive. The full completion is still returned at the end.
    ///
    /// The default implementation degenerates to a single delta; streaming
    /// backends override it.
    async fn generate_streamed(
        &self,
        messages: &[Message],
        max_tokens: u32,
        chunks: mpsc::Sender<String>,
    ) -> Result<Completion> {
        let completion = self.generate(messages, max_tokens).await?;
        // Receiver having gone away is not an error; the caller decides
        // whether the task is still alive.
        let _ = chunks.send(completion.text.clone()).await;
        Ok(completion)
    }

    /// Estimate the token count of a piece of text. Approximate (±10%),
    /// but stable across one task.
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Context window of the model in tokens.
    fn max_context_length(&self) -> usize;
}

/// Production [`LanguageModel`] over an OpenAI-compatible HTTP endpoint.
pub struct LlmClient {
    settings: LlmSettings,
    http: reqwest::Client,
    bpe: CoreBPE,
}

impl LlmClient {
    /// Build a client for the given endpoint.
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(Error::Http)?;

        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| Error::config(format!("failed to load cl100k tokenizer: {}", e)))?;

        Ok(Self {
            settings,
            http,
            bpe,
        })
    }

    fn build_request(&self, messages: &[Message], max_tokens: u32, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: self.settings.model_name.clone(),
            messages: messages.iter().map(Message::to_wire).collect(),
            stream,
            max_tokens: Some(max_tokens),
            temperature: None,
        }
    }

    async fn post(&self, request: &OpenAIRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::api(format!("API error {}: {}", status, body)));
        }

        Ok(response)
    }

    /// Fallback usage numbers for endpoints that omit the usage block.
    fn estimated_usage(&self, messages: &[Message], text: &str) -> (u32, u32) {
        let prompt: usize = messages
            .iter()
            .map(|m| self.estimate_tokens(&m.content))
            .sum();
        (prompt as u32, self.estimate_tokens(text) as u32)
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn generate(&self, messages: &[Message], max_tokens: u32) -> Result<Completion> {
        let request = self.build_request(messages, max_tokens, false);

        // References are copied into the closure so each retry builds a
        // future that borrows from this call frame, not from the closure.
        let this = self;
        let request_ref = &request;
        let result = retry_with_backoff(RetryConfig::llm(), move || async move {
            let response = this.post(request_ref).await?;
            let parsed: OpenAIResponse = response.json().await.map_err(Error::Http)?;
            let choice = parsed
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| Error::api("completion response had no choices"))?;
            Ok((choice.message.content, parsed.usage))
        })
        .await;

        match result {
            Ok((text, usage)) => {
                let (prompt_tokens, completion_tokens) = match usage {
                    Some(u) => (u.prompt_tokens, u.completion_tokens),
                    None => self.estimated_usage(messages, &text),
                };
                Ok(Completion {
                    text,
                    prompt_tokens,
                    completion_tokens,
                })
            }
            Err(e) if is_retryable_error(&e) => Err(Error::transport(e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn generate_streamed(
        &self,
        messages: &[Message],
        max_tokens: u32,
        chunks: mpsc::Sender<String>,
    ) -> Result<Completion> {
        let request = self.build_request(messages, max_tokens, true);

        // Only the initial request is retried. Once deltas have been
        // forwarded, a mid-stream failure cannot be replayed.
        let this = self;
        let request_ref = &request;
        let response = retry_with_backoff(RetryConfig::llm(), move || this.post(request_ref))
            .await
            .map_err(|e| {
                if is_retryable_error(&e) {
                    Error::transport(e.to_string())
                } else {
                    e
                }
            })?;

        let mut events = response.bytes_stream().eventsource();
        let mut text = String::new();
        let mut usage = None;

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| Error::stream(e.to_string()))?;
            if event.data == "[DONE]" {
                break;
            }
            let chunk: OpenAIChunk = serde_json::from_str(&event.data)
                .map_err(|e| Error::stream(format!("failed to parse chunk: {}", e)))?;
            if let Some(u) = chunk.usage {
                usage = Some(u);
            }
            for choice in chunk.choices {
                if let Some(delta) = choice.delta.content {
                    text.push_str(&delta);
                    let _ = chunks.send(delta).await;
                }
            }
        }

        let (prompt_tokens, completion_tokens) = match usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens),
            None => self.estimated_usage(messages, &text),
        };

        Ok(Completion {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn max_context_length(&self) -> usize {
        self.settings.max_context_length
    }
}
