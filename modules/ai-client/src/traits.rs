use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::AiError;

// =============================================================================
// Message types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_response: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: Usage,
}

/// One element of a streaming completion. Deltas arrive in provider order;
/// `Finished` is the last element.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Finished(Option<Usage>),
}

// =============================================================================
// Provider traits
// =============================================================================

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model(&self) -> &str;

    async fn chat(&self, messages: Vec<ChatMessage>, opts: ChatOptions)
        -> Result<ChatOutcome, AiError>;

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamEvent, AiError>>, AiError>;
}

#[async_trait]
pub trait EmbedAgent: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError>;
}
