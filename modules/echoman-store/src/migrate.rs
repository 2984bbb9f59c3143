use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

/// Run idempotent schema migrations for the relational tables.
/// The vector index table is owned by `echoman-vector` and migrated there.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Running schema migrations...");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS source_items (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            dedup_key TEXT NOT NULL UNIQUE,
            run_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL,
            published_at TIMESTAMPTZ,
            fetched_at TIMESTAMPTZ NOT NULL,
            interactions JSONB NOT NULL DEFAULT '{}',
            heat_value DOUBLE PRECISION,
            period TEXT NOT NULL,
            merge_status TEXT NOT NULL DEFAULT 'pending_event_merge',
            period_merge_group_id TEXT,
            occurrence_count INT NOT NULL DEFAULT 0,
            heat_normalized DOUBLE PRECISION,
            embedding_id BIGINT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS source_items_period_status
         ON source_items (period, merge_status)",
        "CREATE INDEX IF NOT EXISTS source_items_group
         ON source_items (period_merge_group_id)",
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            title_key TEXT NOT NULL,
            first_seen TIMESTAMPTZ NOT NULL,
            last_active TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            intensity_total BIGINT NOT NULL DEFAULT 0,
            current_heat_normalized DOUBLE PRECISION NOT NULL DEFAULT 0,
            heat_percentage DOUBLE PRECISION NOT NULL DEFAULT 0,
            summary_id BIGINT,
            category TEXT,
            category_confidence DOUBLE PRECISION,
            category_method TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS topics_last_active ON topics (last_active DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS topic_nodes (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            topic_id BIGINT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            source_item_id BIGINT NOT NULL UNIQUE REFERENCES source_items(id) ON DELETE CASCADE,
            appended_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS topic_nodes_topic ON topic_nodes (topic_id)",
        r#"
        CREATE TABLE IF NOT EXISTS topic_period_heat (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            topic_id BIGINT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            date DATE NOT NULL,
            period TEXT NOT NULL,
            heat_normalized DOUBLE PRECISION NOT NULL,
            heat_percentage DOUBLE PRECISION NOT NULL,
            source_count INT NOT NULL,
            UNIQUE (topic_id, date, period)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS summaries (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            topic_id BIGINT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            method TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            generated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS summaries_topic ON summaries (topic_id, generated_at DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            object_type TEXT NOT NULL,
            object_id BIGINT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        "CREATE INDEX IF NOT EXISTS embeddings_object ON embeddings (object_type, object_id)",
        r#"
        CREATE TABLE IF NOT EXISTS llm_judgements (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            request JSONB NOT NULL,
            response JSONB,
            tokens_prompt INT,
            tokens_completion INT,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            period TEXT,
            status TEXT NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            duration_ms BIGINT,
            input_count INT NOT NULL DEFAULT 0,
            kept_count INT NOT NULL DEFAULT 0,
            dropped_count INT NOT NULL DEFAULT 0,
            error_summary TEXT,
            results JSONB
        )
        "#,
        "CREATE INDEX IF NOT EXISTS pipeline_runs_kind ON pipeline_runs (kind, started_at DESC)",
        r#"
        CREATE TABLE IF NOT EXISTS category_day_metrics (
            id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            day DATE NOT NULL,
            category TEXT NOT NULL,
            topics_count INT NOT NULL DEFAULT 0,
            topics_active INT NOT NULL DEFAULT 0,
            topics_ended INT NOT NULL DEFAULT 0,
            avg_length_hours DOUBLE PRECISION,
            max_length_hours DOUBLE PRECISION,
            min_length_hours DOUBLE PRECISION,
            intensity_sum BIGINT NOT NULL DEFAULT 0,
            intensity_avg DOUBLE PRECISION,
            intensity_max BIGINT,
            heat_sum DOUBLE PRECISION,
            heat_avg DOUBLE PRECISION,
            UNIQUE (day, category)
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("Schema migration complete");
    Ok(())
}
