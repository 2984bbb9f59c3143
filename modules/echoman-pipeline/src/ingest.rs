//! Ingestion boundary. External scrapers hand the core normalized drafts;
//! the core assigns the period, filters noise, and rejects per-run
//! duplicates on (platform, url, run_id).

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use echoman_common::{Platform, PeriodKey};
use echoman_store::{NewSourceItem, RunKind, RunRecord, SourceItem};

use crate::deps::PipelineDeps;

/// URL path suffixes that mark a list page rather than a single story.
const LIST_PAGE_SUFFIXES: [&str; 4] = ["/hot", "/top", "/billboard", "/rank"];

/// A normalized record as delivered by a scraper.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceItemDraft {
    pub platform: Platform,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Server-assigned when the scraper omits it.
    pub fetched_at: Option<DateTime<Utc>>,
    pub heat_value: Option<f64>,
    #[serde(default)]
    pub interactions: HashMap<String, i64>,
    pub run_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub accepted: u32,
    pub duplicates: u32,
    pub rejected_noise: u32,
}

/// Per-run natural dedup key: the same URL may reappear across runs as a
/// fresh atom, so the run id participates in the hash.
pub fn dedup_key(platform: Platform, url: &str, run_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(platform.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(run_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Noise filter: empty titles, configured noise substrings, list-page URLs.
pub fn is_noise(title: &str, url: &str, patterns: &[String]) -> bool {
    let title = title.trim();
    if title.is_empty() {
        return true;
    }
    if patterns.iter().any(|p| title.contains(p.as_str())) {
        return true;
    }
    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or("");
    let path = path.trim_end_matches('/');
    LIST_PAGE_SUFFIXES.iter().any(|s| path.ends_with(s))
}

/// Ingest a batch of drafts. Noise never enters the store; duplicates within
/// the run are dropped by the dedup key. Accepted items land as
/// `pending_event_merge` in the period of their fetch instant.
pub async fn ingest_batch(
    deps: &PipelineDeps,
    drafts: Vec<SourceItemDraft>,
) -> Result<IngestOutcome> {
    let period_hint = PeriodKey::current();
    let run = RunRecord::begin(RunKind::Ingest, Some(period_hint), &deps.pool).await?;
    let input = drafts.len();

    let mut outcome = IngestOutcome::default();

    for draft in drafts {
        if is_noise(&draft.title, &draft.url, &deps.config.noise_title_patterns) {
            debug!(title = %draft.title, "rejected noise item");
            outcome.rejected_noise += 1;
            continue;
        }

        let fetched_at = draft.fetched_at.unwrap_or_else(Utc::now);
        let new_item = NewSourceItem {
            dedup_key: dedup_key(draft.platform, &draft.url, &draft.run_id),
            run_id: draft.run_id,
            platform: draft.platform,
            title: draft.title,
            summary: draft.summary,
            url: draft.url,
            published_at: draft.published_at,
            fetched_at,
            interactions: serde_json::to_value(&draft.interactions)?,
            heat_value: draft.heat_value,
            period: PeriodKey::for_instant(fetched_at),
        };

        match SourceItem::insert_draft(&new_item, &deps.pool).await? {
            Some(_) => outcome.accepted += 1,
            None => outcome.duplicates += 1,
        }
    }

    info!(
        input,
        accepted = outcome.accepted,
        duplicates = outcome.duplicates,
        noise = outcome.rejected_noise,
        "Ingest batch complete"
    );

    run.finish_success(
        input as i32,
        outcome.accepted as i32,
        (outcome.duplicates + outcome.rejected_noise) as i32,
        serde_json::json!({
            "accepted": outcome.accepted,
            "duplicates": outcome.duplicates,
            "rejected_noise": outcome.rejected_noise,
        }),
        &deps.pool,
    )
    .await?;

    Ok(outcome)
}

/// Pull drafts from every registered item source and ingest them.
/// The scheduled ingestion slot calls this; with no sources registered the
/// run is an empty success.
pub async fn run_scheduled_ingest(deps: &PipelineDeps) -> Result<IngestOutcome> {
    let run_id = format!("run_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
    let mut drafts = Vec::new();

    for source in &deps.sources {
        match source.fetch(&run_id).await {
            Ok(mut batch) => {
                for draft in &mut batch {
                    draft.run_id = run_id.clone();
                }
                drafts.extend(batch);
            }
            Err(e) => {
                tracing::warn!(platform = %source.platform(), error = %e, "item source failed");
            }
        }
    }

    ingest_batch(deps, drafts).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<String> {
        vec!["点击查看更多实时热点".to_string(), "榜单完整版".to_string()]
    }

    #[test]
    fn noise_title_is_rejected() {
        assert!(is_noise(
            "点击查看更多实时热点",
            "https://s.weibo.com/article/1",
            &patterns()
        ));
        assert!(is_noise(
            "前往榜单完整版查看",
            "https://s.weibo.com/article/1",
            &patterns()
        ));
    }

    #[test]
    fn empty_title_is_rejected() {
        assert!(is_noise("", "https://example.com/a", &patterns()));
        assert!(is_noise("   ", "https://example.com/a", &patterns()));
    }

    #[test]
    fn list_page_urls_are_rejected() {
        assert!(is_noise("正常标题", "https://s.weibo.com/hot", &patterns()));
        assert!(is_noise("正常标题", "https://tophub.example.com/top/", &patterns()));
        assert!(is_noise("正常标题", "https://bbs.hupu.com/rank", &patterns()));
    }

    #[test]
    fn real_item_passes() {
        assert!(!is_noise(
            "王传君获东京电影节影帝",
            "https://s.weibo.com/weibo?q=abc",
            &patterns()
        ));
    }

    #[test]
    fn dedup_key_varies_by_run() {
        let a = dedup_key(Platform::Weibo, "https://x.com/1", "run_a");
        let b = dedup_key(Platform::Weibo, "https://x.com/1", "run_b");
        assert_ne!(a, b, "same URL in a new run is a fresh atom");
    }

    #[test]
    fn dedup_key_varies_by_platform_and_url() {
        let a = dedup_key(Platform::Weibo, "https://x.com/1", "run_a");
        let b = dedup_key(Platform::Zhihu, "https://x.com/1", "run_a");
        let c = dedup_key(Platform::Weibo, "https://x.com/2", "run_a");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dedup_key_is_stable() {
        let a = dedup_key(Platform::Baidu, "https://x.com/1", "run_a");
        let b = dedup_key(Platform::Baidu, "https://x.com/1", "run_a");
        assert_eq!(a, b);
    }
}
