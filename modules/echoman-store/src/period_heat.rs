use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

use echoman_common::PeriodKey;

/// Per-(topic, date, period) heat snapshot. Within one period a topic's heat
/// is the sum of `heat_normalized` over the source items attached in that
/// period; re-processing the same period replaces the row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopicPeriodHeat {
    pub id: i64,
    pub topic_id: i64,
    pub date: NaiveDate,
    pub period: String,
    pub heat_normalized: f64,
    pub heat_percentage: f64,
    pub source_count: i32,
}

impl TopicPeriodHeat {
    pub async fn upsert<'e>(
        topic_id: i64,
        period: PeriodKey,
        heat_normalized: f64,
        source_count: i32,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO topic_period_heat (
                topic_id, date, period, heat_normalized, heat_percentage, source_count
            )
            VALUES ($1, $2, $3, $4, $4 * 100, $5)
            ON CONFLICT (topic_id, date, period) DO UPDATE
            SET heat_normalized = EXCLUDED.heat_normalized,
                heat_percentage = EXCLUDED.heat_percentage,
                source_count = EXCLUDED.source_count
            RETURNING *
            "#,
        )
        .bind(topic_id)
        .bind(period.date)
        .bind(period.period.as_str())
        .bind(heat_normalized)
        .bind(source_count)
        .fetch_one(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn list_for_topic(topic_id: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM topic_period_heat
            WHERE topic_id = $1
            ORDER BY date ASC, period ASC
            "#,
        )
        .bind(topic_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Zero out every period-heat row of a topic (keep-ratio pruning).
    pub async fn zero_for_topic<'e>(topic_id: i64, executor: impl PgExecutor<'e>) -> Result<()> {
        sqlx::query(
            "UPDATE topic_period_heat SET heat_normalized = 0, heat_percentage = 0 WHERE topic_id = $1",
        )
        .bind(topic_id)
        .execute(executor)
        .await?;
        Ok(())
    }
}
