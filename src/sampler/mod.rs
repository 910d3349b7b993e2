pub mod chat_completion;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

pub use chat_completion::{ChatCompletionSampler, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered, non-empty list of messages with at most one leading system turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Result<Self> {
        if messages.is_empty() {
            return Err(HarnessError::InvalidConversation(
                "conversation has no messages".into(),
            ));
        }
        let system_positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::System)
            .map(|(i, _)| i)
            .collect();
        match system_positions.as_slice() {
            [] | [0] => Ok(Self { messages }),
            [pos] => Err(HarnessError::InvalidConversation(format!(
                "system message must come first, found at position {}",
                pos
            ))),
            many => Err(HarnessError::InvalidConversation(format!(
                "expected at most one system message, found {}",
                many.len()
            ))),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_system(&self) -> bool {
        self.messages[0].role == Role::System
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerErrorKind {
    /// Transient failures persisted through every retry.
    Unavailable,
    /// The endpoint refused the request; retrying would not help.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleResult {
    pub text: String,
    pub raw_response: Option<serde_json::Value>,
    pub succeeded: bool,
    pub error: Option<SamplerErrorKind>,
    pub detail: Option<String>,
    pub attempts: u32,
}

impl SampleResult {
    pub fn success(text: impl Into<String>, raw_response: Option<serde_json::Value>) -> Self {
        Self {
            text: text.into(),
            raw_response,
            succeeded: true,
            error: None,
            detail: None,
            attempts: 1,
        }
    }

    pub fn failure(kind: SamplerErrorKind, detail: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            raw_response: None,
            succeeded: false,
            error: Some(kind),
            detail: Some(detail.into()),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// A model backend. Implementations must not fail past this boundary: every
/// outcome, including exhausted retries, is reported through `SampleResult`.
#[async_trait]
pub trait Sampler: Send + Sync {
    fn model(&self) -> &str;

    async fn sample(&self, conversation: &Conversation, max_output_tokens: u32) -> SampleResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_rejects_empty() {
        let err = Conversation::new(vec![]).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConversation(_)));
    }

    #[test]
    fn test_conversation_system_first() {
        let convo = Conversation::new(vec![Message::system("be terse"), Message::user("hi")])
            .unwrap();
        assert!(convo.has_system());
        assert_eq!(convo.len(), 2);
    }

    #[test]
    fn test_conversation_system_not_first() {
        let err = Conversation::new(vec![Message::user("hi"), Message::system("late")])
            .unwrap_err();
        assert!(err.to_string().contains("position 1"));
    }

    #[test]
    fn test_conversation_two_system_messages() {
        let err = Conversation::new(vec![
            Message::system("a"),
            Message::system("b"),
            Message::user("hi"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("at most one"));
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Message::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }

    #[test]
    fn test_sample_result_constructors() {
        let ok = SampleResult::success("return 1", None);
        assert!(ok.succeeded);
        assert!(ok.error.is_none());

        let failed = SampleResult::failure(SamplerErrorKind::Rejected, "HTTP 400").with_attempts(1);
        assert!(!failed.succeeded);
        assert_eq!(failed.error, Some(SamplerErrorKind::Rejected));
        assert!(failed.text.is_empty());
    }
}
