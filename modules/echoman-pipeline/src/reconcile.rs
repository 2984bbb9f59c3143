//! Vector-index drift repair. The relational store is the ground truth and
//! vector writes land after commits, so a crash can leave a committed row
//! without its vector. This sweep re-upserts missing vectors from the
//! Summary and SourceItem payloads.

use anyhow::Result;
use tracing::{info, warn};

use ai_client::retry;
use echoman_common::{EchomanError, MergeStatus, ObjectKind};
use echoman_store::{SourceItem, Topic};
use echoman_vector::{source_item_vector_id, VectorMetadata};

use crate::deps::PipelineDeps;
use crate::summary::SummaryEngine;

/// Cap on items inspected per sweep; the next sweep continues.
const SWEEP_ITEM_LIMIT: i64 = 2_000;

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub topics_checked: usize,
    pub summaries_repaired: usize,
    pub items_checked: usize,
    pub item_vectors_repaired: usize,
}

pub async fn reconcile_vectors(deps: &PipelineDeps) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    let engine = SummaryEngine::new(deps);

    // Every topic with a summary must be recallable through its vector.
    for topic_id in Topic::ids_with_summary(&deps.pool).await? {
        let Some(topic) = Topic::find_by_id(topic_id, &deps.pool).await? else {
            continue;
        };
        outcome.topics_checked += 1;
        let before = outcome.summaries_repaired;
        if let Some(summary_id) = topic.summary_id {
            let vector_id = echoman_vector::topic_summary_vector_id(summary_id);
            if deps.vectors.fetch(&vector_id).await?.is_none() {
                match engine.ensure_summary_vector(&topic).await {
                    Ok(()) => outcome.summaries_repaired += 1,
                    Err(e) => warn!(topic_id, error = %e, "summary vector repair failed"),
                }
            }
        }
        if outcome.summaries_repaired > before {
            info!(topic_id, "repaired missing topic summary vector");
        }
    }

    // Items waiting for stage two need their vectors for candidate recall.
    let pending =
        SourceItem::with_status(MergeStatus::PendingGlobalMerge, SWEEP_ITEM_LIMIT, &deps.pool)
            .await?;
    for item in pending {
        outcome.items_checked += 1;
        if deps
            .vectors
            .fetch(&source_item_vector_id(item.id))
            .await?
            .is_some()
        {
            continue;
        }

        let text = item.embedding_text();
        let vector = {
            let _permit = deps.provider_gate.acquire().await?;
            retry::with_backoff("embed_reconcile", deps.config.llm_max_retries, || {
                deps.embedder.embed(&text)
            })
            .await
            .map_err(|e| EchomanError::Embedding(e.to_string()))?
        };

        deps.vectors
            .upsert(
                &source_item_vector_id(item.id),
                &vector,
                &VectorMetadata {
                    object_kind: ObjectKind::SourceItem,
                    object_id: item.id,
                    topic_id: None,
                    generated_at: None,
                },
                &text.chars().take(500).collect::<String>(),
            )
            .await?;
        outcome.item_vectors_repaired += 1;
        info!(item_id = item.id, "repaired missing source item vector");
    }

    info!(
        topics = outcome.topics_checked,
        summaries_repaired = outcome.summaries_repaired,
        items = outcome.items_checked,
        item_vectors_repaired = outcome.item_vectors_repaired,
        "Vector reconciliation sweep complete"
    );
    Ok(outcome)
}
