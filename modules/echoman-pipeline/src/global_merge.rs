//! Stage two: global topic association. Each surviving event group either
//! merges into an existing topic (recalled through topic-summary vectors and
//! confirmed by the LLM) or founds a new one. All relational writes for one
//! group commit atomically; vector writes follow the commit.
//!
//! Group processing is serialized: two handlers sharing transactional state
//! on the same topic corrupt the object graph, so `GLOBAL_MERGE_CONCURRENT`
//! stays a tuning knob with 1 as the correctness-safe setting.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use ai_client::retry;
use echoman_common::{EchomanError, MergeStatus, ObjectKind, PeriodKey};
use echoman_store::{
    CategoryDayMetrics, RunKind, RunRecord, SourceItem, Summary, Topic, TopicNode,
    TopicPeriodHeat,
};
use echoman_vector::source_item_vector_id;

use crate::deps::PipelineDeps;
use crate::judge::{Adjudicator, CandidateTopic, TopicDecision};
use crate::summary::SummaryEngine;

#[derive(Debug, Clone, Default)]
pub struct GlobalMergeOutcome {
    pub period: String,
    pub total_groups: usize,
    pub processed_groups: usize,
    pub merge_count: usize,
    pub new_count: usize,
    pub failed_groups: usize,
    pub deferred_groups: usize,
}

enum GroupAction {
    Merged { topic_id: i64 },
    Created { topic_id: i64, heat: f64 },
}

pub async fn run_global_merge(deps: &PipelineDeps, period: PeriodKey) -> Result<GlobalMergeOutcome> {
    info!(period = %period, "Stage two starting");
    let run = RunRecord::begin(RunKind::GlobalMerge, Some(period), &deps.pool).await?;

    match execute(deps, period).await {
        Ok(outcome) => {
            run.finish_success(
                outcome.total_groups as i32,
                (outcome.merge_count + outcome.new_count) as i32,
                outcome.failed_groups as i32,
                json!({
                    "period": outcome.period,
                    "merge_count": outcome.merge_count,
                    "new_count": outcome.new_count,
                    "failed_groups": outcome.failed_groups,
                    "deferred_groups": outcome.deferred_groups,
                    "merge_rate": if outcome.processed_groups > 0 {
                        outcome.merge_count as f64 / outcome.processed_groups as f64
                    } else {
                        0.0
                    },
                }),
                &deps.pool,
            )
            .await?;
            log_merge_completion(deps, period, &outcome).await;
            Ok(outcome)
        }
        Err(e) => {
            run.finish_failure(&e.to_string(), &deps.pool).await?;
            Err(e)
        }
    }
}

/// Marker row read-side consumers poll to detect the latest completed
/// merge. Never fails the batch.
async fn log_merge_completion(deps: &PipelineDeps, period: PeriodKey, outcome: &GlobalMergeOutcome) {
    let stats = json!({
        "period": outcome.period,
        "processed_groups": outcome.processed_groups,
        "merge_count": outcome.merge_count,
        "new_count": outcome.new_count,
    });
    let result = async {
        let marker = RunRecord::begin(RunKind::MergeCompleted, Some(period), &deps.pool).await?;
        marker
            .finish_success(
                outcome.processed_groups as i32,
                (outcome.merge_count + outcome.new_count) as i32,
                0,
                stats,
                &deps.pool,
            )
            .await
    }
    .await;
    if let Err(e) = result {
        warn!(error = %e, period = %period, "failed to record merge completion");
    }
}

async fn execute(deps: &PipelineDeps, period: PeriodKey) -> Result<GlobalMergeOutcome> {
    let items =
        SourceItem::pending_for_period(period, MergeStatus::PendingGlobalMerge, &deps.pool).await?;

    if items.is_empty() {
        info!(period = %period, "Stage two: nothing pending");
        return Ok(GlobalMergeOutcome {
            period: period.to_string(),
            ..Default::default()
        });
    }

    let mut groups = group_by_merge_id(items);
    let total_groups = groups.len();
    info!(period = %period, groups = total_groups, "Stage two input grouped");

    let max_batch = deps.config.global_merge_max_batch_size;
    if groups.len() > max_batch {
        warn!(
            pending = groups.len(),
            max_batch, "group backlog exceeds batch cap, deferring the remainder"
        );
        groups.truncate(max_batch);
    }

    let engine = SummaryEngine::new(deps);
    let adjudicator = Adjudicator::new(deps);
    let deadline = Instant::now() + Duration::from_secs(deps.config.run_soft_timeout_secs);

    let mut outcome = GlobalMergeOutcome {
        period: period.to_string(),
        total_groups,
        ..Default::default()
    };
    let mut new_topics: Vec<(i64, f64)> = Vec::new();
    let mut merged_topics: Vec<i64> = Vec::new();

    for group in &groups {
        if Instant::now() > deadline {
            outcome.deferred_groups = groups.len() - outcome.processed_groups;
            warn!(
                deferred = outcome.deferred_groups,
                "soft deadline crossed, leaving remaining groups for the next run"
            );
            break;
        }

        outcome.processed_groups += 1;
        match process_group(deps, &engine, &adjudicator, group, period).await {
            Ok(GroupAction::Merged { topic_id }) => {
                outcome.merge_count += 1;
                merged_topics.push(topic_id);
            }
            Ok(GroupAction::Created { topic_id, heat }) => {
                outcome.new_count += 1;
                new_topics.push((topic_id, heat));
            }
            Err(e) => {
                // The group's transaction rolled back; its items stay
                // pending_global_merge and the next run retries.
                outcome.failed_groups += 1;
                warn!(error = %e, group = %group[0].period_merge_group_id.as_deref().unwrap_or("?"), "group failed");
            }
        }
    }

    post_batch(deps, &engine, &new_topics, &merged_topics).await;

    // Downstream materialization: per-category day aggregates.
    if let Err(e) = CategoryDayMetrics::refresh_for_day(period, &deps.pool).await {
        warn!(error = %e, "category metrics refresh failed");
    }

    info!(
        period = %period,
        merged = outcome.merge_count,
        created = outcome.new_count,
        failed = outcome.failed_groups,
        deferred = outcome.deferred_groups,
        "Stage two complete"
    );
    Ok(outcome)
}

/// Group pending items by their stage-one assignment, ordered by the
/// representative's fetch time. Items inside a group are fetch-ordered, so
/// the first is the representative.
fn group_by_merge_id(items: Vec<SourceItem>) -> Vec<Vec<SourceItem>> {
    let mut by_group: Vec<(String, Vec<SourceItem>)> = Vec::new();
    for item in items {
        let key = item
            .period_merge_group_id
            .clone()
            .unwrap_or_else(|| format!("item_{}", item.id));
        match by_group.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(item),
            None => by_group.push((key, vec![item])),
        }
    }

    let mut groups: Vec<Vec<SourceItem>> = by_group.into_iter().map(|(_, g)| g).collect();
    for group in &mut groups {
        group.sort_by_key(|i| (i.fetched_at, i.id));
    }
    groups.sort_by_key(|g| (g[0].fetched_at, g[0].id));
    groups
}

fn group_heat(items: &[SourceItem]) -> f64 {
    items.iter().filter_map(|i| i.heat_normalized).sum()
}

async fn process_group(
    deps: &PipelineDeps,
    engine: &SummaryEngine,
    adjudicator: &Adjudicator<'_>,
    group: &[SourceItem],
    period: PeriodKey,
) -> Result<GroupAction> {
    let representative = &group[0];

    let candidates = recall_candidates(deps, representative).await?;
    let decision = adjudicator
        .decide_topic_association(representative, &candidates, period)
        .await?;

    match decision {
        TopicDecision::Merge { topic_id, .. } => {
            // The LLM may name a topic that disappeared since recall.
            match Topic::find_by_id(topic_id, &deps.pool).await? {
                Some(_) => merge_into_topic(deps, engine, topic_id, group, period).await,
                None => {
                    warn!(topic_id, "merge target no longer exists, creating new topic");
                    create_new_topic(deps, engine, group, period).await
                }
            }
        }
        TopicDecision::New { .. } => create_new_topic(deps, engine, group, period).await,
    }
}

/// Top-3 recall over topic-summary vectors, similarity-filtered; falls back
/// to the most recently active topics when nothing clears the bar.
async fn recall_candidates(
    deps: &PipelineDeps,
    representative: &SourceItem,
) -> Result<Vec<CandidateTopic>> {
    let top_k = deps.config.global_merge_topk_candidates;
    let vector = representative_vector(deps, representative).await?;

    let matches = deps
        .vectors
        .query(&vector, (top_k * 2) as i64, Some(ObjectKind::TopicSummary))
        .await?;

    let mut candidates = Vec::new();
    let mut seen_topics = HashSet::new();

    for m in matches {
        let similarity = m.similarity();
        if similarity < deps.config.global_merge_min_similarity {
            continue;
        }
        let Some(topic_id) = m.topic_id else { continue };
        if !seen_topics.insert(topic_id) {
            continue;
        }
        let Some(topic) = Topic::find_by_id(topic_id, &deps.pool).await? else {
            continue;
        };
        candidates.push(candidate_from_topic(deps, topic, Some(similarity)).await?);
        if candidates.len() >= top_k {
            break;
        }
    }

    if candidates.is_empty() {
        for topic in Topic::most_recently_active(top_k as i64, &deps.pool).await? {
            candidates.push(candidate_from_topic(deps, topic, None).await?);
        }
    }

    Ok(candidates)
}

async fn candidate_from_topic(
    deps: &PipelineDeps,
    topic: Topic,
    similarity: Option<f64>,
) -> Result<CandidateTopic> {
    let summary = Summary::current_for_topic(topic.id, &deps.pool)
        .await?
        .map(|s| s.content)
        .unwrap_or_default();
    Ok(CandidateTopic {
        topic_id: topic.id,
        title: topic.title_key.clone(),
        summary,
        last_active: topic.last_active,
        echo_length_hours: topic.echo_length_hours(),
        similarity,
    })
}

/// The representative's vector was indexed by stage one; re-embed only on
/// index drift.
async fn representative_vector(
    deps: &PipelineDeps,
    representative: &SourceItem,
) -> Result<Vec<f32>> {
    if let Some(vector) = deps
        .vectors
        .fetch(&source_item_vector_id(representative.id))
        .await?
    {
        return Ok(vector);
    }

    warn!(item_id = representative.id, "source item vector missing, re-embedding");
    let text = representative.embedding_text();
    let _permit = deps.provider_gate.acquire().await?;
    retry::with_backoff("embed_representative", deps.config.llm_max_retries, || {
        deps.embedder.embed(&text)
    })
    .await
    .map_err(|e| EchomanError::Embedding(e.to_string()).into())
}

async fn merge_into_topic(
    deps: &PipelineDeps,
    engine: &SummaryEngine,
    topic_id: i64,
    group: &[SourceItem],
    period: PeriodKey,
) -> Result<GroupAction> {
    let ids: Vec<i64> = group.iter().map(|i| i.id).collect();
    let heat = group_heat(group);
    let latest_fetch = group.iter().map(|i| i.fetched_at).max().unwrap_or_else(Utc::now);
    let appended_at = Utc::now();

    let mut tx = deps.pool.begin().await?;

    let moved = SourceItem::advance_status(
        &ids,
        MergeStatus::PendingGlobalMerge,
        MergeStatus::Merged,
        &mut *tx,
    )
    .await?;
    if moved != ids.len() as u64 {
        bail!("group raced: expected to merge {} items, moved {moved}", ids.len());
    }

    for item in group {
        TopicNode::create(topic_id, item.id, appended_at, &mut *tx).await?;
    }
    Topic::record_activity(topic_id, latest_fetch, group.len() as i64, &mut *tx).await?;
    TopicPeriodHeat::upsert(topic_id, period, heat, group.len() as i32, &mut *tx).await?;
    Topic::raise_peak_heat(topic_id, heat, &mut *tx).await?;

    tx.commit().await?;
    info!(topic_id, items = group.len(), heat, "Merged group into topic");

    // Vector upkeep happens outside the transaction; drift is recoverable.
    if let Some(topic) = Topic::find_by_id(topic_id, &deps.pool).await? {
        if let Err(e) = engine.ensure_summary_vector(&topic).await {
            warn!(topic_id, error = %e, "failed to ensure summary vector after merge");
        }
    }

    Ok(GroupAction::Merged { topic_id })
}

async fn create_new_topic(
    deps: &PipelineDeps,
    engine: &SummaryEngine,
    group: &[SourceItem],
    period: PeriodKey,
) -> Result<GroupAction> {
    let representative = &group[0];
    let ids: Vec<i64> = group.iter().map(|i| i.id).collect();
    let heat = group_heat(group);
    let first_seen = group.iter().map(|i| i.fetched_at).min().unwrap_or_else(Utc::now);
    let last_active = group.iter().map(|i| i.fetched_at).max().unwrap_or_else(Utc::now);
    let appended_at = Utc::now();

    let mut tx = deps.pool.begin().await?;

    let topic = Topic::create(
        &representative.title,
        first_seen,
        last_active,
        group.len() as i64,
        heat,
        &mut *tx,
    )
    .await?;

    let moved = SourceItem::advance_status(
        &ids,
        MergeStatus::PendingGlobalMerge,
        MergeStatus::Merged,
        &mut *tx,
    )
    .await?;
    if moved != ids.len() as u64 {
        bail!("group raced: expected to merge {} items, moved {moved}", ids.len());
    }

    for item in group {
        TopicNode::create(topic.id, item.id, appended_at, &mut *tx).await?;
    }
    TopicPeriodHeat::upsert(topic.id, period, heat, group.len() as i32, &mut *tx).await?;

    tx.commit().await?;
    info!(topic_id = topic.id, title = %topic.title_key, items = group.len(), "Created new topic");

    // Placeholder + vector immediately: later groups in this batch must be
    // able to recall the topic. Failure does not undo the merge.
    if let Err(e) = engine.create_placeholder(&topic).await {
        warn!(topic_id = topic.id, error = %e, "placeholder summary failed, reconciled later");
    }

    if let Some(classifier) = &deps.classifier {
        let texts: Vec<String> = group.iter().map(|i| i.embedding_text()).collect();
        match classifier.classify(&topic.title_key, &texts).await {
            Ok((category, confidence, method)) => {
                Topic::set_category(topic.id, &category, confidence, &method, &deps.pool).await?;
            }
            Err(e) => warn!(topic_id = topic.id, error = %e, "classification failed"),
        }
    }

    Ok(GroupAction::Created {
        topic_id: topic.id,
        heat,
    })
}

/// Post-batch phase: full summaries for batch-created topics and incremental
/// refreshes for merge targets, with bounded parallelism; then keep-ratio
/// heat pruning.
async fn post_batch(
    deps: &PipelineDeps,
    engine: &SummaryEngine,
    new_topics: &[(i64, f64)],
    merged_topics: &[i64],
) {
    let limit = deps.config.summary_concurrent_size.max(1);
    let gate = std::sync::Arc::new(tokio::sync::Semaphore::new(limit));
    let mut tasks = tokio::task::JoinSet::new();

    for &(topic_id, _) in new_topics {
        let engine = engine.clone();
        let gate = gate.clone();
        tasks.spawn(async move {
            let _permit = gate.acquire().await;
            if let Err(e) = engine.generate_full(topic_id).await {
                warn!(topic_id, error = %e, "full summary failed, placeholder stays current");
            }
        });
    }

    let mut seen = HashSet::new();
    for &topic_id in merged_topics {
        if !seen.insert(topic_id) {
            continue;
        }
        let engine = engine.clone();
        let gate = gate.clone();
        tasks.spawn(async move {
            let _permit = gate.acquire().await;
            if let Err(e) = engine.refresh_incremental(topic_id).await {
                warn!(topic_id, error = %e, "incremental summary refresh failed");
            }
        });
    }

    while tasks.join_next().await.is_some() {}

    let keep_ratio = deps.config.global_merge_new_topic_keep_ratio;
    for topic_id in pruned_topic_ids(new_topics, keep_ratio) {
        info!(topic_id, "zeroing heat of below-ratio new topic");
        if let Err(e) = Topic::zero_heat(topic_id, &deps.pool).await {
            warn!(topic_id, error = %e, "failed to zero topic heat");
            continue;
        }
        if let Err(e) = TopicPeriodHeat::zero_for_topic(topic_id, &deps.pool).await {
            warn!(topic_id, error = %e, "failed to zero period heat");
        }
    }
}

/// With keep_ratio < 1.0, only the top fraction of batch-created topics by
/// heat retain it; the rest get zeroed. Topics are never deleted.
fn pruned_topic_ids(new_topics: &[(i64, f64)], keep_ratio: f64) -> Vec<i64> {
    if keep_ratio >= 1.0 || new_topics.is_empty() {
        return Vec::new();
    }
    let keep = ((new_topics.len() as f64) * keep_ratio.max(0.0)).ceil() as usize;
    let mut sorted: Vec<(i64, f64)> = new_topics.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    sorted.into_iter().skip(keep).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_ratio_one_prunes_nothing() {
        let topics = vec![(1, 0.5), (2, 0.3)];
        assert!(pruned_topic_ids(&topics, 1.0).is_empty());
        assert!(pruned_topic_ids(&topics, 1.5).is_empty());
    }

    #[test]
    fn keep_ratio_half_prunes_coldest() {
        let topics = vec![(1, 0.1), (2, 0.9), (3, 0.5), (4, 0.2)];
        let pruned = pruned_topic_ids(&topics, 0.5);
        // Top 2 by heat (2, 3) survive; 4 and 1 lose their heat.
        assert_eq!(pruned, vec![4, 1]);
    }

    #[test]
    fn keep_ratio_rounds_up() {
        // ceil(3 * 0.5) = 2 kept, 1 pruned.
        let topics = vec![(1, 0.9), (2, 0.5), (3, 0.1)];
        let pruned = pruned_topic_ids(&topics, 0.5);
        assert_eq!(pruned, vec![3]);
    }

    #[test]
    fn keep_ratio_zero_still_never_deletes() {
        let topics = vec![(1, 0.9), (2, 0.5)];
        let pruned = pruned_topic_ids(&topics, 0.0);
        // ceil(0) = 0 kept: every topic's heat is zeroed, none deleted.
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn empty_batch_prunes_nothing() {
        assert!(pruned_topic_ids(&[], 0.5).is_empty());
    }
}
