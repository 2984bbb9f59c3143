use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgExecutor;
use sqlx::PgPool;

/// Attachment of a SourceItem to a Topic. A source item appears in at most
/// one node (UNIQUE on source_item_id); its existence implies the item is
/// `merged`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopicNode {
    pub id: i64,
    pub topic_id: i64,
    pub source_item_id: i64,
    pub appended_at: DateTime<Utc>,
}

/// A node joined with the source item fields the summary engine and the
/// RAG reader need.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TopicNodeItem {
    pub node_id: i64,
    pub topic_id: i64,
    pub source_item_id: i64,
    pub appended_at: DateTime<Utc>,
    pub title: String,
    pub summary: String,
    pub platform: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

impl TopicNode {
    pub async fn create<'e>(
        topic_id: i64,
        source_item_id: i64,
        appended_at: DateTime<Utc>,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO topic_nodes (topic_id, source_item_id, appended_at)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(topic_id)
        .bind(source_item_id)
        .bind(appended_at)
        .fetch_one(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn count_for_topic(topic_id: i64, pool: &PgPool) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM topic_nodes WHERE topic_id = $1")
                .bind(topic_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Member source-item ids, used to post-filter topic-scoped vector recall.
    pub async fn member_item_ids(topic_id: i64, pool: &PgPool) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT source_item_id FROM topic_nodes WHERE topic_id = $1")
                .bind(topic_id)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// The most recently appended nodes with their item payloads.
    pub async fn recent_items_for_topic(
        topic_id: i64,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<TopicNodeItem>> {
        sqlx::query_as::<_, TopicNodeItem>(
            r#"
            SELECT n.id AS node_id, n.topic_id, n.source_item_id, n.appended_at,
                   s.title, s.summary, s.platform, s.url, s.fetched_at
            FROM topic_nodes n
            JOIN source_items s ON s.id = n.source_item_id
            WHERE n.topic_id = $1
            ORDER BY n.appended_at DESC, n.id DESC
            LIMIT $2
            "#,
        )
        .bind(topic_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Nodes appended since a given instant (incremental summary input).
    pub async fn items_appended_since(
        topic_id: i64,
        since: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<Vec<TopicNodeItem>> {
        sqlx::query_as::<_, TopicNodeItem>(
            r#"
            SELECT n.id AS node_id, n.topic_id, n.source_item_id, n.appended_at,
                   s.title, s.summary, s.platform, s.url, s.fetched_at
            FROM topic_nodes n
            JOIN source_items s ON s.id = n.source_item_id
            WHERE n.topic_id = $1 AND n.appended_at > $2
            ORDER BY n.appended_at ASC
            "#,
        )
        .bind(topic_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
