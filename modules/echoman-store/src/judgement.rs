use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;

/// Which adjudication produced the audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgementKind {
    EventMerge,
    GlobalMerge,
    SummarizeFull,
    SummarizeIncremental,
}

impl JudgementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgementKind::EventMerge => "event_merge",
            JudgementKind::GlobalMerge => "global_merge",
            JudgementKind::SummarizeFull => "summarize_full",
            JudgementKind::SummarizeIncremental => "summarize_incremental",
        }
    }
}

impl fmt::Display for JudgementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row for one LLM call: what was asked, what came back, what it cost.
#[derive(Debug, Clone)]
pub struct NewJudgement {
    pub kind: JudgementKind,
    pub status: &'static str,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub tokens_prompt: Option<i32>,
    pub tokens_completion: Option<i32>,
    pub provider: String,
    pub model: String,
}

impl NewJudgement {
    pub async fn insert<'e>(&self, executor: impl PgExecutor<'e>) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO llm_judgements (
                kind, status, request, response, tokens_prompt, tokens_completion,
                provider, model
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(self.kind.as_str())
        .bind(self.status)
        .bind(&self.request)
        .bind(&self.response)
        .bind(self.tokens_prompt)
        .bind(self.tokens_completion)
        .bind(&self.provider)
        .bind(&self.model)
        .fetch_one(executor)
        .await?;
        Ok(id)
    }
}
