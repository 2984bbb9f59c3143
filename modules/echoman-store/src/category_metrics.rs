use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use echoman_common::PeriodKey;

/// Per-(day, category) aggregate over topics first seen that day: echo
/// length, intensity, and heat statistics. Refreshed after each stage-two
/// batch so the read API always serves a consistent materialization.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CategoryDayMetrics {
    pub id: i64,
    pub day: NaiveDate,
    pub category: String,
    pub topics_count: i32,
    pub topics_active: i32,
    pub topics_ended: i32,
    pub avg_length_hours: Option<f64>,
    pub max_length_hours: Option<f64>,
    pub min_length_hours: Option<f64>,
    pub intensity_sum: i64,
    pub intensity_avg: Option<f64>,
    pub intensity_max: Option<i64>,
    pub heat_sum: Option<f64>,
    pub heat_avg: Option<f64>,
}

impl CategoryDayMetrics {
    /// Recompute the aggregates for one day from the topics whose
    /// `first_seen` falls inside it (Asia/Shanghai day boundaries).
    pub async fn refresh_for_day(period: PeriodKey, pool: &PgPool) -> Result<u64> {
        let day_start = period.date_start_utc();
        let day_end = day_start + chrono::Duration::days(1);

        let result = sqlx::query(
            r#"
            INSERT INTO category_day_metrics (
                day, category, topics_count, topics_active, topics_ended,
                avg_length_hours, max_length_hours, min_length_hours,
                intensity_sum, intensity_avg, intensity_max, heat_sum, heat_avg
            )
            SELECT
                $1,
                t.category,
                COUNT(*)::int,
                (COUNT(*) FILTER (WHERE t.status = 'active'))::int,
                (COUNT(*) FILTER (WHERE t.status = 'ended'))::int,
                AVG(EXTRACT(EPOCH FROM (t.last_active - t.first_seen)) / 3600.0),
                MAX(EXTRACT(EPOCH FROM (t.last_active - t.first_seen)) / 3600.0),
                MIN(EXTRACT(EPOCH FROM (t.last_active - t.first_seen)) / 3600.0),
                COALESCE(SUM(t.intensity_total), 0),
                AVG(t.intensity_total),
                MAX(t.intensity_total),
                SUM(t.current_heat_normalized),
                AVG(t.current_heat_normalized)
            FROM topics t
            WHERE t.category IS NOT NULL
              AND t.first_seen >= $2 AND t.first_seen < $3
            GROUP BY t.category
            ON CONFLICT (day, category) DO UPDATE
            SET topics_count = EXCLUDED.topics_count,
                topics_active = EXCLUDED.topics_active,
                topics_ended = EXCLUDED.topics_ended,
                avg_length_hours = EXCLUDED.avg_length_hours,
                max_length_hours = EXCLUDED.max_length_hours,
                min_length_hours = EXCLUDED.min_length_hours,
                intensity_sum = EXCLUDED.intensity_sum,
                intensity_avg = EXCLUDED.intensity_avg,
                intensity_max = EXCLUDED.intensity_max,
                heat_sum = EXCLUDED.heat_sum,
                heat_avg = EXCLUDED.heat_avg
            "#,
        )
        .bind(period.date)
        .bind(day_start)
        .bind(day_end)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn for_day(day: NaiveDate, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM category_day_metrics WHERE day = $1 ORDER BY category",
        )
        .bind(day)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
