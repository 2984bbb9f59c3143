use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use echoman_common::PeriodKey;

/// One invocation of ingestion or a pipeline stage. `MergeCompleted` is a
/// marker written after each successful stage-two batch so read-side
/// consumers can detect the latest completed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Ingest,
    EventMerge,
    GlobalMerge,
    MergeCompleted,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Ingest => "ingest",
            RunKind::EventMerge => "event_merge",
            RunKind::GlobalMerge => "global_merge",
            RunKind::MergeCompleted => "merge_completed",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run record handle. The row is inserted `running` up front so a crash
/// leaves evidence of the attempt; `finish_*` finalizes it.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
}

impl RunRecord {
    pub async fn begin(kind: RunKind, period: Option<PeriodKey>, pool: &PgPool) -> Result<Self> {
        let run_id = format!("{}_{}", kind, &Uuid::new_v4().simple().to_string()[..12]);
        let started_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, kind, period, status, started_at)
            VALUES ($1, $2, $3, 'running', $4)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(&run_id)
        .bind(kind.as_str())
        .bind(period.map(|p| p.to_string()))
        .bind(started_at)
        .execute(pool)
        .await?;

        Ok(Self {
            run_id,
            kind,
            started_at,
        })
    }

    pub async fn finish_success(
        &self,
        input_count: i32,
        kept_count: i32,
        dropped_count: i32,
        results: serde_json::Value,
        pool: &PgPool,
    ) -> Result<()> {
        self.finish("success", input_count, kept_count, dropped_count, None, Some(results), pool)
            .await
    }

    pub async fn finish_failure(&self, error: &str, pool: &PgPool) -> Result<()> {
        self.finish("failed", 0, 0, 0, Some(error), None, pool).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        status: &str,
        input_count: i32,
        kept_count: i32,
        dropped_count: i32,
        error_summary: Option<&str>,
        results: Option<serde_json::Value>,
        pool: &PgPool,
    ) -> Result<()> {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds();

        if let Err(e) = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2, finished_at = $3, duration_ms = $4,
                input_count = $5, kept_count = $6, dropped_count = $7,
                error_summary = $8, results = $9
            WHERE run_id = $1
            "#,
        )
        .bind(&self.run_id)
        .bind(status)
        .bind(finished_at)
        .bind(duration_ms)
        .bind(input_count)
        .bind(kept_count)
        .bind(dropped_count)
        .bind(error_summary)
        .bind(results)
        .execute(pool)
        .await
        {
            warn!(run_id = %self.run_id, error = %e, "Failed to finalize pipeline run record");
            return Err(e.into());
        }
        Ok(())
    }
}
