use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

/// A long-lived event cluster. `intensity_total` tracks the node count;
/// `current_heat_normalized` is the peak across all period-heat rows.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub title_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: String,
    pub intensity_total: i64,
    pub current_heat_normalized: f64,
    pub heat_percentage: f64,
    pub summary_id: Option<i64>,
    pub category: Option<String>,
    pub category_confidence: Option<f64>,
    pub category_method: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    /// Echo length in hours: how long this topic has stayed alive.
    pub fn echo_length_hours(&self) -> f64 {
        (self.last_active - self.first_seen).num_seconds() as f64 / 3600.0
    }

    pub async fn create<'e>(
        title_key: &str,
        first_seen: DateTime<Utc>,
        last_active: DateTime<Utc>,
        intensity_total: i64,
        heat_normalized: f64,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO topics (
                title_key, first_seen, last_active, status,
                intensity_total, current_heat_normalized, heat_percentage
            )
            VALUES ($1, $2, $3, 'active', $4, $5, $5 * 100)
            RETURNING *
            "#,
        )
        .bind(title_key)
        .bind(first_seen)
        .bind(last_active)
        .bind(intensity_total)
        .bind(heat_normalized)
        .fetch_one(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id<'e>(id: i64, executor: impl PgExecutor<'e>) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM topics WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// Topics that should have a recallable summary vector.
    pub async fn ids_with_summary(pool: &PgPool) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM topics WHERE summary_id IS NOT NULL ORDER BY id")
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Fallback recall: the most recently active topics.
    pub async fn most_recently_active(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM topics ORDER BY last_active DESC LIMIT $1")
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Fold a merged group into the topic: advance `last_active` (never
    /// backward) and count the new nodes into `intensity_total`.
    pub async fn record_activity<'e>(
        id: i64,
        latest_fetch: DateTime<Utc>,
        added_nodes: i64,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE topics
            SET last_active = GREATEST(last_active, $2),
                intensity_total = intensity_total + $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(latest_fetch)
        .bind(added_nodes)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Raise the topic's peak heat if this period's heat exceeds it.
    /// Returns true when the peak moved.
    pub async fn raise_peak_heat<'e>(
        id: i64,
        heat_normalized: f64,
        executor: impl PgExecutor<'e>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE topics
            SET current_heat_normalized = $2, heat_percentage = $2 * 100
            WHERE id = $1 AND current_heat_normalized < $2
            "#,
        )
        .bind(id)
        .bind(heat_normalized)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_summary<'e>(
        id: i64,
        summary_id: i64,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query("UPDATE topics SET summary_id = $2 WHERE id = $1")
            .bind(id)
            .bind(summary_id)
            .execute(executor)
            .await?;
        Ok(())
    }

    pub async fn set_category<'e>(
        id: i64,
        category: &str,
        confidence: f64,
        method: &str,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE topics
            SET category = $2, category_confidence = $3, category_method = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(category)
        .bind(confidence)
        .bind(method)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Zero a topic's heat (keep-ratio pruning). The topic itself survives.
    pub async fn zero_heat<'e>(id: i64, executor: impl PgExecutor<'e>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE topics SET current_heat_normalized = 0, heat_percentage = 0 WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }
}
