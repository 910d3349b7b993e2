use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Conversation, Message, SampleResult, Sampler, SamplerErrorKind};
use crate::error::{HarnessError, Result};

pub const OPENAI_SYSTEM_MESSAGE_API: &str = "You are a helpful assistant.";

const DEFAULT_TEMPERATURE: f32 = 0.5;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const MAX_ERROR_SNIPPET: usize = 300;

/// Exponential backoff with jitter, bounded in attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the retry that follows `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after
            .map(|d| d.min(self.max_delay))
            .unwrap_or_else(|| self.backoff(attempt));
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        delay + jitter
    }
}

enum AttemptError {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Rejected(String),
}

impl AttemptError {
    fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

/// Sampler for OpenAI-compatible `/chat/completions` endpoints.
pub struct ChatCompletionSampler {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_message: Option<String>,
    temperature: f32,
    retry: RetryPolicy,
}

impl ChatCompletionSampler {
    pub fn new(
        model: impl Into<String>,
        base_url: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: None,
            system_message: None,
            temperature: DEFAULT_TEMPERATURE,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, conversation: &Conversation, max_output_tokens: u32) -> Value {
        let mut messages: Vec<Message> = Vec::with_capacity(conversation.len() + 1);
        if !conversation.has_system() {
            if let Some(ref system) = self.system_message {
                messages.push(Message::system(system.clone()));
            }
        }
        messages.extend(conversation.messages().iter().cloned());

        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_output_tokens,
            "temperature": self.temperature,
        })
    }

    async fn attempt(&self, body: &Value) -> std::result::Result<(String, Value), AttemptError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AttemptError::transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            let reason = format!("HTTP {}: {}", status.as_u16(), snippet(&text));
            return Err(if is_retryable_status(status) {
                AttemptError::Transient {
                    reason,
                    retry_after,
                }
            } else {
                AttemptError::Rejected(reason)
            });
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| AttemptError::transient(format!("unparseable response body: {}", e)))?;
        let text = parse_completion(&raw)?;
        Ok((text, raw))
    }
}

#[async_trait]
impl Sampler for ChatCompletionSampler {
    fn model(&self) -> &str {
        &self.model
    }

    async fn sample(&self, conversation: &Conversation, max_output_tokens: u32) -> SampleResult {
        let body = self.request_body(conversation, max_output_tokens);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(&body).await {
                Ok((text, raw)) => {
                    debug!(model = %self.model, attempt, "Sample received");
                    return SampleResult::success(text, Some(raw)).with_attempts(attempt);
                }
                Err(AttemptError::Rejected(reason)) => {
                    warn!(model = %self.model, attempt, reason = %reason, "Sample rejected");
                    return SampleResult::failure(SamplerErrorKind::Rejected, reason)
                        .with_attempts(attempt);
                }
                Err(AttemptError::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt < max_attempts {
                        let delay = self.retry.delay(attempt, retry_after);
                        warn!(
                            model = %self.model,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Transient sampler failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_reason = reason;
                }
            }
        }

        warn!(
            model = %self.model,
            attempts = max_attempts,
            reason = %last_reason,
            "Sampler unavailable, retries exhausted"
        );
        SampleResult::failure(SamplerErrorKind::Unavailable, last_reason).with_attempts(max_attempts)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS
        )
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        // Values past Duration's range saturate; the retry policy caps them anyway.
        .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

fn parse_completion(raw: &Value) -> std::result::Result<String, AttemptError> {
    let choice = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AttemptError::transient("response has no choices"))?;

    if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(AttemptError::Rejected(
            "completion withheld by content filter".into(),
        ));
    }

    let message = choice.get("message");
    if let Some(refusal) = message
        .and_then(|m| m.get("refusal"))
        .and_then(Value::as_str)
    {
        return Err(AttemptError::Rejected(format!(
            "model refused: {}",
            snippet(refusal)
        )));
    }

    message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AttemptError::transient("response carried no completion content"))
}

fn snippet(s: &str) -> String {
    s.chars().take(MAX_ERROR_SNIPPET).collect()
}
