//! Topic summaries: synchronous placeholders at topic birth, LLM full
//! summaries in the post-batch phase, incremental refreshes as topics keep
//! accumulating nodes. Every successful write leaves `topics.summary_id`
//! pointing at the newest row and a `topic_summary_<id>` vector behind it —
//! that vector is what stage-two recall finds.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use ai_client::budget::truncate_to_tokens;
use ai_client::{retry, ChatMessage, ChatOptions, ChatProvider, EmbedAgent};
use echoman_common::{EchomanError, ObjectKind};
use echoman_store::{
    JudgementKind, NewJudgement, Summary, SummaryMethod, Topic, TopicNode, TopicNodeItem,
};
use echoman_vector::{topic_summary_vector_id, VectorIndex, VectorMetadata};

use crate::deps::PipelineDeps;

/// Incremental refresh fires only once this many nodes have arrived since
/// the current summary was generated.
const MIN_NODES_FOR_UPDATE: usize = 3;
/// And only after the current summary has aged this long.
const UPDATE_INTERVAL_HOURS: i64 = 6;
/// Full summaries read at most this many recent nodes.
const MAX_CONTEXT_NODES: i64 = 15;

const MAX_PROMPT_TOKENS: usize = 4_000;
const MAX_COMPLETION_TOKENS: u32 = 1_000;
const MAX_NODE_SUMMARY_TOKENS: usize = 150;

#[derive(Clone)]
pub struct SummaryEngine {
    pool: PgPool,
    llm: Arc<dyn ChatProvider>,
    embedder: Arc<dyn EmbedAgent>,
    vectors: VectorIndex,
    provider_gate: Arc<Semaphore>,
    max_retries: u32,
}

impl SummaryEngine {
    pub fn new(deps: &PipelineDeps) -> Self {
        Self {
            pool: deps.pool.clone(),
            llm: deps.llm.clone(),
            embedder: deps.embedder.clone(),
            vectors: deps.vectors.clone(),
            provider_gate: deps.provider_gate.clone(),
            max_retries: deps.config.llm_max_retries,
        }
    }

    /// Rule-generated placeholder text, no LLM involved.
    pub fn placeholder_content(title_key: &str, node_count: i64) -> String {
        format!(
            "「{title_key}」近期成为热点，已汇集 {node_count} 条来自多平台的相关报道，详细摘要生成中。"
        )
    }

    /// Write a placeholder summary and its vector immediately, so recall
    /// inside the same batch can find the topic.
    pub async fn create_placeholder(&self, topic: &Topic) -> Result<Summary> {
        let node_count = TopicNode::count_for_topic(topic.id, &self.pool).await?;
        let content = Self::placeholder_content(&topic.title_key, node_count.max(1));
        self.persist(topic.id, &content, SummaryMethod::Placeholder, topic.summary_id)
            .await
    }

    /// Make sure the topic is recallable: a summary row exists and its
    /// vector is present in the index. Repairs vector drift on the way.
    pub async fn ensure_summary_vector(&self, topic: &Topic) -> Result<()> {
        if let Some(summary_id) = topic.summary_id {
            if self
                .vectors
                .fetch(&topic_summary_vector_id(summary_id))
                .await?
                .is_some()
            {
                return Ok(());
            }
            if let Some(summary) = Summary::find_by_id(summary_id, &self.pool).await? {
                warn!(topic_id = topic.id, summary_id, "summary vector missing, re-upserting");
                return self.index_summary(&summary).await;
            }
        }
        self.create_placeholder(topic).await?;
        Ok(())
    }

    /// LLM full summary over the topic's recent nodes. The caller guarantees
    /// a placeholder already exists, so a provider failure here leaves the
    /// topic recallable.
    pub async fn generate_full(&self, topic_id: i64) -> Result<Summary> {
        let topic = Topic::find_by_id(topic_id, &self.pool)
            .await?
            .context("topic vanished before summary generation")?;
        let nodes = TopicNode::recent_items_for_topic(topic_id, MAX_CONTEXT_NODES, &self.pool).await?;

        if nodes.is_empty() {
            return self.create_placeholder(&topic).await;
        }

        let prompt = build_full_prompt(&topic, &nodes);
        let content = self
            .call_llm(prompt, JudgementKind::SummarizeFull, topic_id)
            .await?;

        let summary = self
            .persist(topic_id, content.trim(), SummaryMethod::Full, topic.summary_id)
            .await?;
        info!(topic_id, summary_id = summary.id, "Full summary generated");
        Ok(summary)
    }

    /// Fold newly merged nodes into the existing summary. Returns None when
    /// the refresh gate (node count, age) says nothing needs to change.
    pub async fn refresh_incremental(&self, topic_id: i64) -> Result<Option<Summary>> {
        let Some(current) = Summary::current_for_topic(topic_id, &self.pool).await? else {
            return self.generate_full(topic_id).await.map(Some);
        };

        // A placeholder is not worth updating incrementally; replace it.
        if current.method()? == SummaryMethod::Placeholder {
            return self.generate_full(topic_id).await.map(Some);
        }

        let age_hours = (chrono::Utc::now() - current.generated_at).num_hours();
        if age_hours < UPDATE_INTERVAL_HOURS {
            return Ok(None);
        }

        let new_nodes =
            TopicNode::items_appended_since(topic_id, current.generated_at, &self.pool).await?;
        if new_nodes.len() < MIN_NODES_FOR_UPDATE {
            return Ok(None);
        }

        let topic = Topic::find_by_id(topic_id, &self.pool)
            .await?
            .context("topic vanished before incremental summary")?;
        let prompt = build_incremental_prompt(&topic, &current.content, &new_nodes);
        let content = self
            .call_llm(prompt, JudgementKind::SummarizeIncremental, topic_id)
            .await?;

        let summary = self
            .persist(
                topic_id,
                content.trim(),
                SummaryMethod::Incremental,
                topic.summary_id,
            )
            .await?;
        info!(topic_id, summary_id = summary.id, new_nodes = new_nodes.len(), "Incremental summary generated");
        Ok(Some(summary))
    }

    /// Insert the row and repoint the topic in one transaction; index the
    /// vector after commit. A missing vector is recoverable drift, a missing
    /// row is not — so the relational pair commits or rolls back together.
    async fn persist(
        &self,
        topic_id: i64,
        content: &str,
        method: SummaryMethod,
        superseded_summary_id: Option<i64>,
    ) -> Result<Summary> {
        let mut tx = self.pool.begin().await?;
        let summary = Summary::insert(
            topic_id,
            content,
            method,
            Some(self.llm.provider_name()),
            Some(self.llm.model()),
            &mut *tx,
        )
        .await?;
        Topic::set_summary(topic_id, summary.id, &mut *tx).await?;
        tx.commit().await?;

        if let Err(e) = self.index_summary(&summary).await {
            warn!(topic_id, summary_id = summary.id, error = %e, "summary vector upsert failed, drift flagged");
            return Ok(summary);
        }

        if let Some(old_id) = superseded_summary_id {
            if old_id != summary.id {
                if let Err(e) = self.vectors.delete(&[topic_summary_vector_id(old_id)]).await {
                    warn!(old_summary_id = old_id, error = %e, "failed to drop superseded summary vector");
                }
            }
        }

        Ok(summary)
    }

    async fn index_summary(&self, summary: &Summary) -> Result<()> {
        let vector = {
            let _permit = self.provider_gate.acquire().await?;
            retry::with_backoff("embed_summary", self.max_retries, || {
                self.embedder.embed(&summary.content)
            })
            .await
            .map_err(|e| EchomanError::Embedding(e.to_string()))?
        };

        self.vectors
            .upsert(
                &topic_summary_vector_id(summary.id),
                &vector,
                &VectorMetadata {
                    object_kind: ObjectKind::TopicSummary,
                    object_id: summary.id,
                    topic_id: Some(summary.topic_id),
                    generated_at: Some(summary.generated_at),
                },
                &summary.content,
            )
            .await
    }

    async fn call_llm(
        &self,
        prompt: String,
        kind: JudgementKind,
        topic_id: i64,
    ) -> Result<String> {
        let prompt = truncate_to_tokens(&prompt, MAX_PROMPT_TOKENS);
        let messages = vec![ChatMessage::user(prompt)];
        let opts = ChatOptions {
            temperature: Some(0.3),
            max_tokens: Some(MAX_COMPLETION_TOKENS),
            json_response: false,
        };

        let outcome = {
            let _permit = self.provider_gate.acquire().await?;
            retry::with_backoff(kind.as_str(), self.max_retries, || {
                self.llm.chat(messages.clone(), opts.clone())
            })
            .await
        };

        let (status, response, usage) = match &outcome {
            Ok(o) => ("success", Some(json!({"summary": o.content})), Some(o.usage)),
            Err(e) => ("failed", Some(json!({"error": e.to_string()})), None),
        };
        let judgement = NewJudgement {
            kind,
            status,
            request: json!({"topic_id": topic_id}),
            response,
            tokens_prompt: usage.map(|u| u.prompt_tokens as i32),
            tokens_completion: usage.map(|u| u.completion_tokens as i32),
            provider: self.llm.provider_name().to_string(),
            model: self.llm.model().to_string(),
        };
        if let Err(e) = judgement.insert(&self.pool).await {
            warn!(error = %e, "failed to record summary judgement");
        }

        let outcome = outcome.map_err(|e| EchomanError::Llm(e.to_string()))?;
        if outcome.content.trim().is_empty() {
            return Err(EchomanError::MalformedResponse("empty summary".into()).into());
        }
        Ok(outcome.content)
    }
}

fn node_line(node: &TopicNodeItem) -> String {
    let summary = if node.summary.is_empty() {
        "无".to_string()
    } else {
        truncate_to_tokens(&node.summary, MAX_NODE_SUMMARY_TOKENS)
    };
    format!(
        "- [{}] {} （{}，{}）",
        node.platform,
        node.title,
        summary,
        node.fetched_at.format("%m-%d %H:%M"),
    )
}

fn build_full_prompt(topic: &Topic, nodes: &[TopicNodeItem]) -> String {
    let lines: Vec<String> = nodes.iter().map(node_line).collect();
    format!(
        "为以下热点主题撰写一段客观、紧凑的中文摘要（200字以内），概括事件脉络与当前进展，\
         不要编造报道之外的内容：\n\n主题：{}\n相关报道（按时间倒序）：\n{}\n\n直接输出摘要正文。",
        topic.title_key,
        lines.join("\n"),
    )
}

fn build_incremental_prompt(
    topic: &Topic,
    current_summary: &str,
    new_nodes: &[TopicNodeItem],
) -> String {
    let lines: Vec<String> = new_nodes.iter().map(node_line).collect();
    format!(
        "以下是热点主题「{}」的现有摘要与新增报道。请在保留既有事实的基础上融入新进展，\
         输出更新后的完整中文摘要（200字以内）：\n\n现有摘要：\n{}\n\n新增报道：\n{}\n\n\
         直接输出更新后的摘要正文。",
        topic.title_key,
        current_summary,
        lines.join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_carries_title_and_count() {
        let content = SummaryEngine::placeholder_content("王传君获东京电影节影帝", 2);
        assert!(content.contains("王传君获东京电影节影帝"));
        assert!(content.contains('2'));
    }

    #[test]
    fn placeholder_is_short() {
        let content = SummaryEngine::placeholder_content("标题", 1);
        assert!(content.chars().count() < 120);
    }
}
