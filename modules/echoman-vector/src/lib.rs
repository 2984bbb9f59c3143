//! Vector index adapter backed by pgvector.
//!
//! Holds two object kinds: `source_item_<id>` embeddings written by stage
//! one, and `topic_summary_<summary_id>` embeddings written by the summary
//! engine. Stage two and the RAG reader query by cosine distance; callers
//! convert distance to similarity via [`VectorMatch::similarity`].

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::PgPool;
use tracing::info;

use echoman_common::ObjectKind;

/// pgvector refuses ANN indexes above this dimensionality; larger embedding
/// models fall back to exact scans, which stay correct but unindexed.
const MAX_INDEXABLE_DIMENSION: usize = 2000;

/// Per-query deadline against the index.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn source_item_vector_id(item_id: i64) -> String {
    format!("source_item_{item_id}")
}

pub fn topic_summary_vector_id(summary_id: i64) -> String {
    format!("topic_summary_{summary_id}")
}

/// Payload metadata stored alongside each vector.
#[derive(Debug, Clone)]
pub struct VectorMetadata {
    pub object_kind: ObjectKind,
    pub object_id: i64,
    pub topic_id: Option<i64>,
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub distance: f64,
    pub object_id: i64,
    pub topic_id: Option<i64>,
}

impl VectorMatch {
    /// Cosine similarity derived from the index's cosine distance.
    pub fn similarity(&self) -> f64 {
        1.0 - self.distance
    }
}

#[derive(Clone)]
pub struct VectorIndex {
    pool: PgPool,
    dimension: usize,
}

impl VectorIndex {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    /// Create the extension, table, and (when the dimension allows) the ANN
    /// index. Idempotent.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .context("pgvector extension unavailable")?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS vector_index (
                id TEXT PRIMARY KEY,
                embedding vector({}) NOT NULL,
                object_type TEXT NOT NULL,
                object_id BIGINT NOT NULL,
                topic_id BIGINT,
                generated_at TIMESTAMPTZ,
                document TEXT NOT NULL DEFAULT ''
            )
            "#,
            self.dimension
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS vector_index_object_type ON vector_index (object_type)",
        )
        .execute(&self.pool)
        .await?;

        if self.dimension <= MAX_INDEXABLE_DIMENSION {
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS vector_index_embedding
                 ON vector_index USING hnsw (embedding vector_cosine_ops)",
            )
            .execute(&self.pool)
            .await?;
        } else {
            info!(
                dimension = self.dimension,
                "embedding dimension exceeds pgvector index limit, using exact scans"
            );
        }

        Ok(())
    }

    pub async fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: &VectorMetadata,
        document: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vector_index (id, embedding, object_type, object_id, topic_id, generated_at, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET embedding = EXCLUDED.embedding,
                object_type = EXCLUDED.object_type,
                object_id = EXCLUDED.object_id,
                topic_id = EXCLUDED.topic_id,
                generated_at = EXCLUDED.generated_at,
                document = EXCLUDED.document
            "#,
        )
        .bind(id)
        .bind(Vector::from(vector.to_vec()))
        .bind(metadata.object_kind.as_str())
        .bind(metadata.object_id)
        .bind(metadata.topic_id)
        .bind(metadata.generated_at)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Nearest neighbours by cosine distance, optionally filtered to one
    /// object kind, closest first.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: i64,
        object_kind: Option<ObjectKind>,
    ) -> Result<Vec<VectorMatch>> {
        let rows: Vec<(String, f64, i64, Option<i64>)> = tokio::time::timeout(
            QUERY_TIMEOUT,
            sqlx::query_as(
                r#"
                SELECT id, (embedding <=> $1)::float8 AS distance, object_id, topic_id
                FROM vector_index
                WHERE $2::text IS NULL OR object_type = $2
                ORDER BY embedding <=> $1
                LIMIT $3
                "#,
            )
            .bind(Vector::from(vector.to_vec()))
            .bind(object_kind.map(|k| k.as_str()))
            .bind(top_k)
            .fetch_all(&self.pool),
        )
        .await
        .context("vector query timed out")??;

        Ok(rows
            .into_iter()
            .map(|(id, distance, object_id, topic_id)| VectorMatch {
                id,
                distance,
                object_id,
                topic_id,
            })
            .collect())
    }

    /// Fetch one stored vector by id.
    pub async fn fetch(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let row: Option<(Vector,)> =
            sqlx::query_as("SELECT embedding FROM vector_index WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v.to_vec()))
    }

    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        sqlx::query("DELETE FROM vector_index WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_ids_are_stable() {
        assert_eq!(source_item_vector_id(42), "source_item_42");
        assert_eq!(topic_summary_vector_id(7), "topic_summary_7");
    }

    #[test]
    fn similarity_inverts_distance() {
        let m = VectorMatch {
            id: "source_item_1".into(),
            distance: 0.22,
            object_id: 1,
            topic_id: None,
        };
        assert!((m.similarity() - 0.78).abs() < 1e-9);
    }
}
