use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

use echoman_common::{EchomanError, MergeStatus, PeriodKey, Platform};

/// One atom produced by one platform at one fetch. Mutated only by stage one
/// and stage two; never re-processed once merged or discarded.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceItem {
    pub id: i64,
    pub dedup_key: String,
    pub run_id: String,
    pub platform: String,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub interactions: serde_json::Value,
    pub heat_value: Option<f64>,
    pub period: String,
    pub merge_status: String,
    pub period_merge_group_id: Option<String>,
    pub occurrence_count: i32,
    pub heat_normalized: Option<f64>,
    pub embedding_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A draft accepted from an external scraper, ready for insertion.
#[derive(Debug, Clone)]
pub struct NewSourceItem {
    pub dedup_key: String,
    pub run_id: String,
    pub platform: Platform,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub interactions: serde_json::Value,
    pub heat_value: Option<f64>,
    pub period: PeriodKey,
}

impl SourceItem {
    pub fn platform(&self) -> Result<Platform, EchomanError> {
        self.platform.parse()
    }

    pub fn status(&self) -> Result<MergeStatus, EchomanError> {
        self.merge_status.parse()
    }

    /// The embedding input: title and summary concatenated.
    pub fn embedding_text(&self) -> String {
        if self.summary.is_empty() {
            self.title.clone()
        } else {
            format!("{} {}", self.title, self.summary)
        }
    }

    /// Insert a draft. Returns None when the (platform, url, run_id) dedup
    /// key already exists — the same URL in the same run is a duplicate.
    pub async fn insert_draft(draft: &NewSourceItem, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO source_items (
                dedup_key, run_id, platform, title, summary, url,
                published_at, fetched_at, interactions, heat_value, period, merge_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending_event_merge')
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&draft.dedup_key)
        .bind(&draft.run_id)
        .bind(draft.platform.as_str())
        .bind(&draft.title)
        .bind(&draft.summary)
        .bind(&draft.url)
        .bind(draft.published_at)
        .bind(draft.fetched_at)
        .bind(&draft.interactions)
        .bind(draft.heat_value)
        .bind(draft.period.to_string())
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM source_items WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// All items in one period at one pipeline position, oldest fetch first.
    pub async fn pending_for_period(
        period: PeriodKey,
        status: MergeStatus,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM source_items
            WHERE period = $1 AND merge_status = $2
            ORDER BY fetched_at ASC, id ASC
            "#,
        )
        .bind(period.to_string())
        .bind(status.as_str())
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Items at one pipeline position across all periods, oldest first.
    /// Used by the reconciliation sweep.
    pub async fn with_status(status: MergeStatus, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM source_items
            WHERE merge_status = $1
            ORDER BY fetched_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn count_for_period(
        period: PeriodKey,
        status: MergeStatus,
        pool: &PgPool,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM source_items WHERE period = $1 AND merge_status = $2",
        )
        .bind(period.to_string())
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub async fn set_heat_normalized<'e>(
        id: i64,
        heat_normalized: f64,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query("UPDATE source_items SET heat_normalized = $2 WHERE id = $1")
            .bind(id)
            .bind(heat_normalized)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_embedding_id<'e>(
        id: i64,
        embedding_id: i64,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query("UPDATE source_items SET embedding_id = $2 WHERE id = $1")
            .bind(id)
            .bind(embedding_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Stamp a stage-one group assignment on a set of items.
    pub async fn assign_group<'e>(
        ids: &[i64],
        group_id: &str,
        occurrence_count: i32,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE source_items
            SET period_merge_group_id = $2, occurrence_count = $3
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .bind(group_id)
        .bind(occurrence_count)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Move a set of items forward through the state machine. The WHERE
    /// clause pins the expected current status, so a transition observed
    /// out of order updates zero rows. Returns the number of rows moved.
    pub async fn advance_status<'e>(
        ids: &[i64],
        from: MergeStatus,
        to: MergeStatus,
        executor: impl PgExecutor<'e>,
    ) -> Result<u64> {
        if !from.can_transition_to(to) {
            return Err(EchomanError::Validation(format!(
                "illegal merge_status transition {from} -> {to}"
            ))
            .into());
        }
        let result = sqlx::query(
            "UPDATE source_items SET merge_status = $3 WHERE id = ANY($1) AND merge_status = $2",
        )
        .bind(ids)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}
