//! OpenAI-compatible provider. Works against any endpoint speaking the
//! `/chat/completions` + `/embeddings` protocol (Qwen serving stacks, vLLM,
//! OpenAI itself).

mod client;
mod types;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::AiError;
use crate::traits::{
    ChatMessage, ChatOptions, ChatOutcome, ChatProvider, EmbedAgent, MessageRole, StreamEvent,
    Usage,
};

use client::OpenAiClient;
use types::*;

pub struct OpenAi {
    client: OpenAiClient,
    provider_name: String,
    model: String,
    embedding_model: String,
    chat_timeout: Duration,
    embed_timeout: Duration,
}

impl OpenAi {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            client: OpenAiClient::new(api_key, base_url),
            provider_name: "openai-compatible".to_string(),
            model: model.to_string(),
            embedding_model: model.to_string(),
            chat_timeout: Duration::from_secs(30),
            embed_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = model.to_string();
        self
    }

    pub fn with_chat_timeout(mut self, timeout: Duration) -> Self {
        self.chat_timeout = timeout;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    fn build_request(&self, messages: Vec<ChatMessage>, opts: &ChatOptions) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: messages.into_iter().map(wire_message).collect(),
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            response_format: opts.json_response.then(ResponseFormat::json_object),
            stream: None,
            stream_options: None,
        }
    }
}

fn wire_message(message: ChatMessage) -> WireMessage {
    WireMessage {
        role: match message.role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        },
        content: message.content,
    }
}

#[async_trait]
impl ChatProvider for OpenAi {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Result<ChatOutcome, AiError> {
        let request = self.build_request(messages, &opts);
        let response = self.client.chat(&request, self.chat_timeout).await?;

        let usage = response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(AiError::Empty)?;

        Ok(ChatOutcome { content, usage })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        opts: ChatOptions,
    ) -> Result<BoxStream<'static, Result<StreamEvent, AiError>>, AiError> {
        let mut request = self.build_request(messages, &opts);
        request.stream = Some(true);
        request.stream_options = Some(StreamOptions {
            include_usage: true,
        });
        self.client.chat_stream(&request, self.chat_timeout).await
    }
}

#[async_trait]
impl EmbedAgent for OpenAi {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let texts = [text.to_string()];
        let mut vectors = self
            .client
            .embed_batch(&self.embedding_model, &texts, self.embed_timeout)
            .await?;
        vectors.pop().ok_or(AiError::Empty)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.client
            .embed_batch(&self.embedding_model, &texts, self.embed_timeout)
            .await
    }
}
