//! OpenAI-compatible Chat Completions client used as the production oracle.
//!
//! Works against api.openai.com and any server speaking the same wire format
//! (Ollama, LM Studio, vLLM). The bearer token is read from the configured
//! environment variable on every call so rotated keys are picked up.

use super::{clean_response, TextOracle};
use crate::config::OracleConfig;
use crate::{DistillError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_BASE_DELAY_MS: u64 = 200;
const SYSTEM_PROMPT: &str =
    "You maintain concise written summaries about one person. Follow the output format exactly.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct HttpOracle {
    client: Client,
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("distill/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DistillError::Config(format!("http client: {e}")))?;

        debug!(
            "HTTP oracle: model={}, base_url={}, attempts={}",
            config.model, config.base_url, config.max_attempts
        );
        Ok(Self { client, config })
    }

    fn api_key(&self) -> Option<String> {
        let var = self.config.api_key_env.as_deref()?;
        std::env::var(var)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Exponential backoff with a small deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    async fn send_once(&self, prompt: &str) -> std::result::Result<String, CallError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: false,
        };

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (name, value) in &self.config.http_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(key) = self.api_key() {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::fatal(format!("malformed response: {e}")))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CallError::fatal("response had no choices".to_string()))
    }

    fn map_reqwest_error(e: reqwest::Error) -> CallError {
        if e.is_timeout() {
            CallError::fatal(format!("timeout: {e}"))
        } else if e.is_connect() {
            CallError {
                error: DistillError::Oracle(format!("network: {e}")),
                retryable: true,
            }
        } else {
            CallError::fatal(e.to_string())
        }
    }
}

/// A failed call, classified when it is built
#[derive(Debug)]
struct CallError {
    error: DistillError,
    retryable: bool,
}

impl CallError {
    fn fatal(message: String) -> Self {
        Self {
            error: DistillError::Oracle(message),
            retryable: false,
        }
    }

    /// 5xx is retryable; every other non-success status is not
    fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = truncate(&extract_error_detail(body), 500);
        let message = if detail.is_empty() {
            format!("API error {status}")
        } else {
            format!("API error {status}: {detail}")
        };
        Self {
            error: DistillError::Oracle(message),
            retryable: status.is_server_error(),
        }
    }
}

#[async_trait]
impl TextOracle for HttpOracle {
    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!("Oracle call, prompt length: {}", prompt.len());

        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(prompt).await {
                Ok(content) => return Ok(clean_response(&content)),
                Err(e) if attempt < attempts && e.retryable => {
                    let delay = Self::retry_backoff(attempt);
                    warn!(
                        "Oracle call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, attempts, delay, e.error
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.error),
            }
        }
    }
}

fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    trimmed.to_string()
}

fn truncate(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }
    let mut truncated: String = detail.chars().take(max_chars).collect();
    truncated.push_str("... [truncated]");
    truncated
}
