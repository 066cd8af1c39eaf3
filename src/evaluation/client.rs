//! Model client trait and the OpenRouter implementation.
//!
//! The wire contract is OpenAI-style chat completions over HTTPS. The
//! client returns raw text plus usage; all JSON tolerance lives in the
//! parser, not here.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::evaluation::types::{ModelReply, ModelRequest, TokenUsage};

/// Client for a chat-completions model endpoint.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one evaluation prompt and return the raw reply.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply>;
}

/// OpenRouter (or any OpenAI-compatible) chat-completions client.
pub struct OpenRouterClient {
    config: ApiConfig,
    api_key: String,
    http: Client,
}

impl OpenRouterClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let api_key = config.resolve_key().ok_or_else(|| {
            Error::config("no API key: set ApiConfig.api_key or OPENROUTER_API_KEY")
        })?;
        // The builder timeout is a backstop; each call also enforces its own
        // deadline so one slow evaluator cannot stall a whole round.
        let http = Client::builder()
            .timeout(Duration::from_secs(config.per_call_timeout_secs))
            .build()
            .map_err(|e| Error::network(format!("HTTP client construction failed: {e}")))?;

        Ok(Self {
            config,
            api_key,
            http,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

// Wire types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply> {
        let api_request = ChatCompletionRequest {
            model: &request.model,
            messages: vec![WireMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let started = Instant::now();
        let deadline = Duration::from_millis(request.timeout_ms);

        let send = self
            .http
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send();

        let response = match tokio::time::timeout(deadline, send).await {
            Err(_) => return Err(Error::timeout(request.timeout_ms)),
            Ok(Err(e)) if e.is_timeout() => return Err(Error::timeout(request.timeout_ms)),
            Ok(Err(e)) => return Err(Error::network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let body = match tokio::time::timeout(deadline.saturating_sub(started.elapsed()), response.text())
            .await
        {
            Err(_) => return Err(Error::timeout(request.timeout_ms)),
            Ok(Err(e)) => return Err(Error::network(e.to_string())),
            Ok(Ok(body)) => body,
        };

        if !status.is_success() {
            let mut detail = body;
            detail.truncate(500);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: detail,
            });
        }

        let api_response: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| Error::parse(format!("response body: {e}")))?;

        let content = api_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(Error::EmptyResponse);
        }

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ModelReply {
            raw_text: content,
            usage,
            elapsed_ms: started.elapsed().as_millis() as u64,
            cost: None,
        })
    }
}
