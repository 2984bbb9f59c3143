use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use crate::error::AiError;
use crate::traits::{StreamEvent, Usage};

use super::types::*;

pub(crate) struct OpenAiClient {
    api_key: String,
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, AiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| AiError::Malformed(format!("bad api key header: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    pub async fn chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, AiError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Provider { status, message });
        }

        Ok(response.json().await?)
    }

    /// Open a streaming completion. Deltas are forwarded in provider order;
    /// the final element carries the usage block when the provider sends one.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        connect_timeout: Duration,
    ) -> Result<BoxStream<'static, Result<StreamEvent, AiError>>, AiError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %request.model, "streaming chat request");

        let send = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send();

        let response = tokio::time::timeout(connect_timeout, send)
            .await
            .map_err(|_| AiError::Timeout(connect_timeout.as_secs()))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Provider { status, message });
        }

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(pump_sse(response, tx));
        Ok(rx.boxed())
    }

    pub async fn embed_batch(
        &self,
        model: &str,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, AiError> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: model.to_string(),
            input: serde_json::Value::Array(
                texts
                    .iter()
                    .map(|t| serde_json::Value::String(t.clone()))
                    .collect(),
            ),
        };

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Provider { status, message });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.len() != texts.len() {
            return Err(AiError::Malformed(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Read the SSE body and forward parsed deltas. A dropped receiver (client
/// cancellation) ends the read, aborting the upstream stream.
async fn pump_sse(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<Result<StreamEvent, AiError>>,
) {
    let mut body = response.bytes_stream();
    let mut buffer = Vec::new();
    let mut usage: Option<Usage> = None;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.unbounded_send(Err(AiError::Http(e)));
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();

            if payload == "[DONE]" {
                let _ = tx.unbounded_send(Ok(StreamEvent::Finished(usage)));
                return;
            }

            match serde_json::from_str::<StreamChunk>(payload) {
                Ok(parsed) => {
                    if let Some(u) = parsed.usage {
                        usage = Some(Usage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                        });
                    }
                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && tx.unbounded_send(Ok(StreamEvent::Delta(content))).is_err()
                            {
                                // Receiver gone — the caller cancelled.
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.unbounded_send(Err(AiError::Malformed(format!(
                        "unparseable stream chunk: {e}"
                    ))));
                    return;
                }
            }
        }
    }

    // Stream ended without [DONE]; still terminate the event sequence.
    let _ = tx.unbounded_send(Ok(StreamEvent::Finished(usage)));
}
