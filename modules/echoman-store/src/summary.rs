use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

use echoman_common::EchomanError;

/// How a summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMethod {
    Placeholder,
    Full,
    Incremental,
}

impl SummaryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryMethod::Placeholder => "placeholder",
            SummaryMethod::Full => "full",
            SummaryMethod::Incremental => "incremental",
        }
    }
}

impl FromStr for SummaryMethod {
    type Err = EchomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placeholder" => Ok(SummaryMethod::Placeholder),
            "full" => Ok(SummaryMethod::Full),
            "incremental" => Ok(SummaryMethod::Incremental),
            other => Err(EchomanError::Validation(format!(
                "unknown summary method: {other}"
            ))),
        }
    }
}

impl fmt::Display for SummaryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated textual snapshot of a topic. `topics.summary_id` points at
/// the most recent row for the topic.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Summary {
    pub id: i64,
    pub topic_id: i64,
    pub content: String,
    pub method: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    pub fn method(&self) -> Result<SummaryMethod, EchomanError> {
        self.method.parse()
    }

    pub async fn insert<'e>(
        topic_id: i64,
        content: &str,
        method: SummaryMethod,
        provider: Option<&str>,
        model: Option<&str>,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO summaries (topic_id, content, method, provider, model)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(topic_id)
        .bind(content)
        .bind(method.as_str())
        .bind(provider)
        .bind(model)
        .fetch_one(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM summaries WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// The summary `topics.summary_id` currently points at.
    pub async fn current_for_topic(topic_id: i64, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT s.* FROM summaries s
            JOIN topics t ON t.summary_id = s.id
            WHERE t.id = $1
            "#,
        )
        .bind(topic_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }
}
