//! Retrieval-augmented reader. Topic mode answers about one topic from its
//! summary and member items; global mode recalls the closest topics across
//! the corpus. Context is packed under the token budget, the answer streams
//! as typed events.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use ai_client::budget::TokenBudget;
use ai_client::{retry, ChatMessage, ChatOptions, ChatProvider, EmbedAgent, StreamEvent};
use echoman_common::{Config, ObjectKind};
use echoman_store::{SourceItem, Summary, Topic, TopicNode};
use echoman_vector::VectorIndex;

use crate::events::{Citation, Diagnostics, RagEvent};

/// Topic mode packs at most this many member items.
const TOPIC_MODE_NODE_LIMIT: usize = 5;
/// Global mode recalls this many topics.
const GLOBAL_MODE_TOPIC_LIMIT: i64 = 10;
/// And shows this many recent nodes per recalled topic.
const GLOBAL_MODE_NODES_PER_TOPIC: i64 = 2;

const SYSTEM_PROMPT: &str = "你是热点事件问答助手。严格依据提供的资料回答问题，\
    不得编造资料之外的信息；若资料不足以回答，明确说明证据不足。回答使用中文。";

const FALLBACK_ANSWER: &str = "抱歉，当前没有检索到与该问题相关的热点资料，无法给出有依据的回答。";

#[derive(Debug, Clone, Copy)]
pub enum RagMode {
    Topic { topic_id: i64 },
    Global,
}

#[derive(Clone)]
pub struct RagReader {
    pool: PgPool,
    llm: Arc<dyn ChatProvider>,
    embedder: Arc<dyn EmbedAgent>,
    vectors: VectorIndex,
    provider_gate: Arc<Semaphore>,
    budget: TokenBudget,
    max_completion_tokens: usize,
    max_retries: u32,
}

struct Retrieval {
    chunks: Vec<String>,
    citations: Vec<Citation>,
}

/// A complete, non-streaming answer.
#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub diagnostics: Diagnostics,
}

impl RagReader {
    pub fn new(
        pool: PgPool,
        config: &Config,
        llm: Arc<dyn ChatProvider>,
        embedder: Arc<dyn EmbedAgent>,
        vectors: VectorIndex,
    ) -> Self {
        Self {
            pool,
            llm,
            embedder,
            vectors,
            provider_gate: Arc::new(Semaphore::new(config.llm_max_concurrent.max(1))),
            budget: TokenBudget::new(config.rag_context_limit, config.rag_safety_margin),
            max_completion_tokens: config.rag_max_completion_tokens,
            max_retries: config.llm_max_retries,
        }
    }

    /// Answer a query as a typed event stream. Dropping the stream cancels
    /// the upstream LLM call.
    pub fn ask_stream(&self, query: &str, mode: RagMode) -> BoxStream<'static, RagEvent> {
        let reader = self.clone();
        let query = query.to_string();
        let (tx, rx) = mpsc::unbounded();

        tokio::spawn(async move {
            let started = Instant::now();
            if let Err(e) = reader.answer(&query, mode, started, &tx).await {
                warn!(error = %e, "rag answer failed");
                let _ = tx.unbounded_send(RagEvent::Error {
                    message: e.to_string(),
                });
            }
        });

        rx.boxed()
    }

    /// Answer a query in one round trip, without streaming.
    pub async fn ask(&self, query: &str, mode: RagMode) -> Result<RagAnswer> {
        let started = Instant::now();
        let retrieval = match mode {
            RagMode::Topic { topic_id } => self.retrieve_topic_context(topic_id, query).await?,
            RagMode::Global => self.retrieve_global_context(query).await?,
        };

        if retrieval.chunks.is_empty() {
            return Ok(RagAnswer {
                answer: FALLBACK_ANSWER.to_string(),
                citations: Vec::new(),
                diagnostics: Diagnostics {
                    latency_ms: started.elapsed().as_millis() as i64,
                    fallback: true,
                    ..Default::default()
                },
            });
        }

        let available =
            self.budget
                .available_context_tokens(SYSTEM_PROMPT, query, self.max_completion_tokens);
        let packed = self.budget.pack_chunks(&retrieval.chunks, available);

        let prompt = format!(
            "资料：\n{}\n\n问题：{}\n\n请依据上述资料回答。",
            packed.chunks.join("\n\n"),
            query,
        );
        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let opts = ChatOptions {
            temperature: Some(0.7),
            max_tokens: Some(self.max_completion_tokens as u32),
            json_response: false,
        };

        let outcome = {
            let _permit = self.provider_gate.acquire().await?;
            retry::with_backoff("rag_answer", self.max_retries, || {
                self.llm.chat(messages.clone(), opts.clone())
            })
            .await
            .context("answer generation failed")?
        };

        Ok(RagAnswer {
            answer: outcome.content,
            citations: retrieval.citations,
            diagnostics: Diagnostics {
                latency_ms: started.elapsed().as_millis() as i64,
                tokens_prompt: outcome.usage.prompt_tokens,
                tokens_completion: outcome.usage.completion_tokens,
                context_chunks: packed.chunks.len(),
                fallback: false,
            },
        })
    }

    async fn answer(
        &self,
        query: &str,
        mode: RagMode,
        started: Instant,
        tx: &mpsc::UnboundedSender<RagEvent>,
    ) -> Result<()> {
        let retrieval = match mode {
            RagMode::Topic { topic_id } => self.retrieve_topic_context(topic_id, query).await?,
            RagMode::Global => self.retrieve_global_context(query).await?,
        };

        // Empty retrieval: canned fallback, flagged in diagnostics.
        if retrieval.chunks.is_empty() {
            let _ = tx.unbounded_send(RagEvent::Token {
                content: FALLBACK_ANSWER.to_string(),
            });
            let _ = tx.unbounded_send(RagEvent::Done {
                diagnostics: Diagnostics {
                    latency_ms: started.elapsed().as_millis() as i64,
                    fallback: true,
                    ..Default::default()
                },
            });
            return Ok(());
        }

        let available =
            self.budget
                .available_context_tokens(SYSTEM_PROMPT, query, self.max_completion_tokens);
        let packed = self.budget.pack_chunks(&retrieval.chunks, available);
        info!(
            chunks = packed.chunks.len(),
            used_tokens = packed.used_tokens,
            truncated = packed.truncated_last,
            "RAG context packed"
        );

        let prompt = format!(
            "资料：\n{}\n\n问题：{}\n\n请依据上述资料回答。",
            packed.chunks.join("\n\n"),
            query,
        );
        let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let opts = ChatOptions {
            temperature: Some(0.7),
            max_tokens: Some(self.max_completion_tokens as u32),
            json_response: false,
        };

        let mut stream = {
            let _permit = self.provider_gate.acquire().await?;
            self.llm
                .chat_stream(messages, opts)
                .await
                .context("failed to open answer stream")?
        };

        let mut usage = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Delta(content)) => {
                    if tx.unbounded_send(RagEvent::Token { content }).is_err() {
                        // Client cancelled; dropping the stream aborts upstream.
                        return Ok(());
                    }
                }
                Ok(StreamEvent::Finished(u)) => {
                    usage = u;
                    break;
                }
                Err(e) => {
                    let _ = tx.unbounded_send(RagEvent::Error {
                        message: e.to_string(),
                    });
                    return Ok(());
                }
            }
        }

        let _ = tx.unbounded_send(RagEvent::Citations {
            citations: retrieval.citations,
        });
        let _ = tx.unbounded_send(RagEvent::Done {
            diagnostics: Diagnostics {
                latency_ms: started.elapsed().as_millis() as i64,
                tokens_prompt: usage.map(|u| u.prompt_tokens).unwrap_or_default(),
                tokens_completion: usage.map(|u| u.completion_tokens).unwrap_or_default(),
                context_chunks: packed.chunks.len(),
                fallback: false,
            },
        });
        Ok(())
    }

    /// Topic mode: current summary plus the query-closest member items.
    async fn retrieve_topic_context(&self, topic_id: i64, query: &str) -> Result<Retrieval> {
        let topic = Topic::find_by_id(topic_id, &self.pool)
            .await?
            .with_context(|| format!("topic {topic_id} not found"))?;

        let mut chunks = Vec::new();
        let mut citations = Vec::new();

        if let Some(summary) = Summary::current_for_topic(topic_id, &self.pool).await? {
            chunks.push(format!("【主题摘要】{}\n{}", topic.title_key, summary.content));
        }

        let members: std::collections::HashSet<i64> =
            TopicNode::member_item_ids(topic_id, &self.pool)
                .await?
                .into_iter()
                .collect();
        if members.is_empty() {
            return Ok(Retrieval { chunks, citations });
        }

        let query_vector = self.embed_query(query).await?;
        let matches = self
            .vectors
            .query(
                &query_vector,
                (members.len() + TOPIC_MODE_NODE_LIMIT) as i64,
                Some(ObjectKind::SourceItem),
            )
            .await?;

        for m in matches {
            if citations.len() >= TOPIC_MODE_NODE_LIMIT {
                break;
            }
            if !members.contains(&m.object_id) || m.similarity() < 0.0 {
                continue;
            }
            let Some(item) = SourceItem::find_by_id(m.object_id, &self.pool).await? else {
                continue;
            };
            chunks.push(format!(
                "【相关报道】{} （{}，{}）\n{}",
                item.title,
                item.platform,
                item.fetched_at.format("%Y-%m-%d %H:%M"),
                item.summary,
            ));
            citations.push(Citation {
                title: item.title.clone(),
                url: item.url.clone(),
                platform: item.platform.clone(),
                snippet: snippet(&item.summary, &item.title),
                topic_id: Some(topic_id),
            });
        }

        Ok(Retrieval { chunks, citations })
    }

    /// Global mode: the closest topic summaries, each with its freshest nodes.
    async fn retrieve_global_context(&self, query: &str) -> Result<Retrieval> {
        let query_vector = self.embed_query(query).await?;
        let matches = self
            .vectors
            .query(
                &query_vector,
                GLOBAL_MODE_TOPIC_LIMIT,
                Some(ObjectKind::TopicSummary),
            )
            .await?;

        let mut chunks = Vec::new();
        let mut citations = Vec::new();
        let mut seen_topics = std::collections::HashSet::new();

        for m in matches {
            let Some(topic_id) = m.topic_id else { continue };
            if !seen_topics.insert(topic_id) {
                continue;
            }
            let Some(topic) = Topic::find_by_id(topic_id, &self.pool).await? else {
                continue;
            };
            let summary = Summary::current_for_topic(topic_id, &self.pool)
                .await?
                .map(|s| s.content)
                .unwrap_or_default();

            let nodes = TopicNode::recent_items_for_topic(
                topic_id,
                GLOBAL_MODE_NODES_PER_TOPIC,
                &self.pool,
            )
            .await?;
            let node_lines: Vec<String> = nodes
                .iter()
                .map(|n| {
                    format!(
                        "  - {} （{}，{}）",
                        n.title,
                        n.platform,
                        n.fetched_at.format("%m-%d %H:%M")
                    )
                })
                .collect();

            chunks.push(format!(
                "【主题】{}\n摘要：{}\n近期报道：\n{}",
                topic.title_key,
                summary,
                node_lines.join("\n"),
            ));
            for node in &nodes {
                citations.push(Citation {
                    title: node.title.clone(),
                    url: node.url.clone(),
                    platform: node.platform.clone(),
                    snippet: snippet(&node.summary, &node.title),
                    topic_id: Some(topic_id),
                });
            }
        }

        Ok(Retrieval { chunks, citations })
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let _permit = self.provider_gate.acquire().await?;
        retry::with_backoff("embed_query", self.max_retries, || {
            self.embedder.embed(query)
        })
        .await
        .map_err(|e| anyhow::anyhow!("query embedding failed: {e}"))
    }
}

fn snippet(summary: &str, title: &str) -> String {
    let source = if summary.is_empty() { title } else { summary };
    source.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_prefers_summary() {
        assert_eq!(snippet("摘要内容", "标题"), "摘要内容");
        assert_eq!(snippet("", "标题"), "标题");
    }

    #[test]
    fn snippet_is_bounded() {
        let long = "长".repeat(500);
        assert_eq!(snippet(&long, "t").chars().count(), 120);
    }
}
