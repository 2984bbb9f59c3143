//! Stage one: per-period event deduplication. Normalizes heat, embeds new
//! items, clusters them into candidate groups, lets the LLM confirm
//! multi-item groups, and applies the occurrence filter. Survivors advance
//! to `pending_global_merge`; singletons are discarded.
//!
//! Re-running a period is safe: the status transition is the source of
//! truth, so a second run finds nothing pending and changes nothing.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use ai_client::retry;
use echoman_common::{text, EchomanError, MergeStatus, ObjectKind, PeriodKey};
use echoman_store::{EmbeddingRecord, RunKind, RunRecord, SourceItem};
use echoman_vector::{source_item_vector_id, VectorMetadata};

use crate::cluster::{build_candidate_groups, Clusterable};
use crate::deps::PipelineDeps;
use crate::judge::Adjudicator;
use crate::normalize;

/// Vector-index documents keep a bounded excerpt, not the full payload.
const VECTOR_DOCUMENT_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct EventMergeOutcome {
    pub period: String,
    pub input_items: usize,
    pub kept_items: usize,
    pub dropped_items: usize,
    pub merge_groups: usize,
}

pub async fn run_event_merge(deps: &PipelineDeps, period: PeriodKey) -> Result<EventMergeOutcome> {
    info!(period = %period, "Stage one starting");
    let run = RunRecord::begin(RunKind::EventMerge, Some(period), &deps.pool).await?;

    match execute(deps, period).await {
        Ok(outcome) => {
            run.finish_success(
                outcome.input_items as i32,
                outcome.kept_items as i32,
                outcome.dropped_items as i32,
                json!({
                    "period": outcome.period,
                    "merge_groups": outcome.merge_groups,
                    "keep_rate": if outcome.input_items > 0 {
                        outcome.kept_items as f64 / outcome.input_items as f64
                    } else {
                        0.0
                    },
                }),
                &deps.pool,
            )
            .await?;
            Ok(outcome)
        }
        Err(e) => {
            run.finish_failure(&e.to_string(), &deps.pool).await?;
            Err(e)
        }
    }
}

async fn execute(deps: &PipelineDeps, period: PeriodKey) -> Result<EventMergeOutcome> {
    let mut items =
        SourceItem::pending_for_period(period, MergeStatus::PendingEventMerge, &deps.pool).await?;

    if items.is_empty() {
        info!(period = %period, "Stage one: nothing pending");
        return Ok(EventMergeOutcome {
            period: period.to_string(),
            ..Default::default()
        });
    }
    let input_items = items.len();
    info!(period = %period, items = input_items, "Stage one input loaded");

    // 1. Heat normalization (fails the run on arithmetic impossibility only).
    normalize::normalize_items(deps, &mut items).await?;

    // 2. Embed and index. Relational rows first, vector upserts after.
    let embeddings = embed_items(deps, &items).await?;

    // 3. Candidate groups from vector + title similarity.
    let clusterables: Vec<Clusterable> = items
        .iter()
        .zip(&embeddings)
        .map(|(item, embedding)| Clusterable {
            item_id: item.id,
            normalized_title: text::normalize_title(&item.title),
            fetched_at: item.fetched_at,
            embedding: embedding.clone(),
        })
        .collect();

    let candidate_groups = build_candidate_groups(
        &clusterables,
        deps.config.halfday_merge_similarity_threshold,
        deps.config.halfday_merge_jaccard_threshold,
    );
    info!(groups = candidate_groups.len(), "Candidate clustering complete");

    // 4. LLM confirmation. Unconfirmed multi-item groups split back into
    // singletons; the LLM never merges beyond what clustering proposed.
    let adjudicator = Adjudicator::new(deps);
    let mut final_groups: Vec<Vec<usize>> = Vec::new();

    for group in candidate_groups {
        if group.len() < 2 {
            final_groups.push(group);
            continue;
        }

        let group_items: Vec<&SourceItem> = group.iter().map(|&i| &items[i]).collect();
        let confirmed = match adjudicator.confirm_event_group(&group_items).await {
            Ok(verdict) => {
                verdict.is_same_event
                    && verdict.confidence >= deps.config.halfday_merge_llm_confidence
            }
            Err(e) => {
                warn!(error = %e, size = group.len(), "group confirmation failed, splitting");
                false
            }
        };

        if confirmed {
            final_groups.push(group);
        } else {
            final_groups.extend(group.into_iter().map(|i| vec![i]));
        }
    }

    // 5. Stamp group ids and occurrence counts, then apply the filter.
    let min_occurrence = deps.config.halfday_merge_min_occurrence as usize;
    let mut kept_ids: Vec<i64> = Vec::new();
    let mut dropped_ids: Vec<i64> = Vec::new();

    for group in &final_groups {
        let group_id = format!("event_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let ids: Vec<i64> = group.iter().map(|&i| items[i].id).collect();
        SourceItem::assign_group(&ids, &group_id, ids.len() as i32, &deps.pool).await?;

        if ids.len() >= min_occurrence {
            kept_ids.extend(ids);
        } else {
            dropped_ids.extend(ids);
        }
    }

    SourceItem::advance_status(
        &kept_ids,
        MergeStatus::PendingEventMerge,
        MergeStatus::PendingGlobalMerge,
        &deps.pool,
    )
    .await?;
    SourceItem::advance_status(
        &dropped_ids,
        MergeStatus::PendingEventMerge,
        MergeStatus::Discarded,
        &deps.pool,
    )
    .await?;

    let outcome = EventMergeOutcome {
        period: period.to_string(),
        input_items,
        kept_items: kept_ids.len(),
        dropped_items: dropped_ids.len(),
        merge_groups: final_groups.len(),
    };
    info!(
        period = %period,
        kept = outcome.kept_items,
        dropped = outcome.dropped_items,
        groups = outcome.merge_groups,
        "Stage one complete"
    );
    Ok(outcome)
}

/// Embed every item's title + summary, record the embedding provenance rows,
/// and upsert the `source_item_<id>` vectors. Returns the vectors in item
/// order.
async fn embed_items(deps: &PipelineDeps, items: &[SourceItem]) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = items.iter().map(|i| i.embedding_text()).collect();

    let vectors = {
        let _permit = deps.provider_gate.acquire().await?;
        retry::with_backoff("embed_batch", deps.config.llm_max_retries, || {
            deps.embedder.embed_batch(texts.clone())
        })
        .await
        .map_err(|e| EchomanError::Embedding(e.to_string()))?
    };

    for (item, _vector) in items.iter().zip(&vectors) {
        let record = EmbeddingRecord::insert(
            ObjectKind::SourceItem,
            item.id,
            deps.embedder.provider_name(),
            deps.embedder.model(),
            &deps.pool,
        )
        .await?;
        SourceItem::set_embedding_id(item.id, record.id, &deps.pool).await?;
    }

    for (item, vector) in items.iter().zip(&vectors) {
        let document: String = item.embedding_text().chars().take(VECTOR_DOCUMENT_MAX_CHARS).collect();
        deps.vectors
            .upsert(
                &source_item_vector_id(item.id),
                vector,
                &VectorMetadata {
                    object_kind: ObjectKind::SourceItem,
                    object_id: item.id,
                    topic_id: None,
                    generated_at: None,
                },
                &document,
            )
            .await?;
    }

    info!(vectors = vectors.len(), "Item embeddings indexed");
    Ok(vectors)
}
