//! Text-completion capability abstraction
//!
//! Routing stages that need a language model talk to it through the
//! `CompletionClient` trait. `HttpCompletion` is the production client for an
//! Anthropic-style messages endpoint; `StaticCompletion` serves canned replies
//! for tests and offline use.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Requested shape of the completion output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Token accounting reported by the completion backend
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A single completion reply
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// External text-completion capability used by the classifier stages
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
        format: ResponseFormat,
    ) -> Result<CompletionResponse>;
}

/// HTTP completion client for an Anthropic-style messages endpoint
#[derive(Clone)]
pub struct HttpCompletion {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl std::fmt::Debug for HttpCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Mask the API key in debug output
        let masked_key = if self.api_key.len() > 7 {
            format!(
                "{}...{}",
                &self.api_key[..3],
                &self.api_key[self.api_key.len() - 4..]
            )
        } else {
            "***".to_string()
        };

        f.debug_struct("HttpCompletion")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &masked_key)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl HttpCompletion {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            model: model.unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            max_tokens: 1024,
        }
    }

    /// Set a custom base URL (e.g. for proxies or regional endpoints)
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl CompletionClient for HttpCompletion {
    async fn complete(
        &self,
        prompt: &str,
        system: &str,
        temperature: f32,
        format: ResponseFormat,
    ) -> Result<CompletionResponse> {
        let url = format!("{}/v1/messages", self.base_url);

        // JSON-format requests append an explicit instruction; the endpoint
        // itself has no structured-output switch.
        let prompt = match format {
            ResponseFormat::Json => format!("{prompt}\n\nRespond with valid JSON only."),
            ResponseFormat::Text => prompt.to_string(),
        };

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": temperature,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        debug!("Sending completion request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send completion request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Completion request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        let content = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<String>();

        Ok(CompletionResponse {
            content,
            usage: parsed.usage.unwrap_or_default(),
            model: parsed.model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// Scripted completion client for tests and the offline CLI.
///
/// Replies are served in FIFO order; when the queue is empty every call fails,
/// which exercises the chain's demote-to-no-decision paths.
#[derive(Debug, Default)]
pub struct StaticCompletion {
    replies: Mutex<VecDeque<String>>,
}

impl StaticCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = String>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("replies mutex poisoned")
            .push_back(reply.into());
    }
}

#[async_trait]
impl CompletionClient for StaticCompletion {
    async fn complete(
        &self,
        _prompt: &str,
        _system: &str,
        _temperature: f32,
        _format: ResponseFormat,
    ) -> Result<CompletionResponse> {
        let next = self
            .replies
            .lock()
            .expect("replies mutex poisoned")
            .pop_front();
        match next {
            Some(content) => Ok(CompletionResponse {
                content,
                usage: TokenUsage::default(),
                model: "static".to_string(),
            }),
            None => Err(anyhow!("No scripted completion available")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_completion_serves_in_order() {
        let client = StaticCompletion::with_replies(vec!["one".to_string(), "two".to_string()]);
        let first = client
            .complete("p", "s", 0.1, ResponseFormat::Text)
            .await
            .unwrap();
        assert_eq!(first.content, "one");
        let second = client
            .complete("p", "s", 0.1, ResponseFormat::Text)
            .await
            .unwrap();
        assert_eq!(second.content, "two");
    }

    #[tokio::test]
    async fn test_static_completion_errors_when_empty() {
        let client = StaticCompletion::new();
        let result = client.complete("p", "s", 0.1, ResponseFormat::Json).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_http_completion_debug_masks_key() {
        let client = HttpCompletion::new("sk-ant-secret-key-1234".to_string(), None);
        let debug = format!("{:?}", client);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("sk-"));
        assert!(debug.contains("1234"));
    }

    #[test]
    fn test_http_completion_base_url_override() {
        let client = HttpCompletion::new("key".to_string(), Some("test-model".to_string()))
            .with_base_url("http://localhost:9999".to_string());
        let debug = format!("{:?}", client);
        assert!(debug.contains("localhost:9999"));
        assert!(debug.contains("test-model"));
    }
}
