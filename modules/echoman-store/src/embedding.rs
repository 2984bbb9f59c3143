use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;

use echoman_common::ObjectKind;

/// Bookkeeping link between an object and its vector: the vector payload
/// lives in the vector index, this row records provider/model provenance.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub object_type: String,
    pub object_id: i64,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub async fn insert<'e>(
        object_kind: ObjectKind,
        object_id: i64,
        provider: &str,
        model: &str,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO embeddings (object_type, object_id, provider, model)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(object_kind.as_str())
        .bind(object_id)
        .bind(provider)
        .bind(model)
        .fetch_one(executor)
        .await
        .map_err(Into::into)
    }
}
