use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai_client::OpenAi;
use echoman_common::{Config, PeriodKey};
use echoman_pipeline::{scheduler, PipelineDeps};
use echoman_rag::{RagMode, RagReader};
use echoman_vector::VectorIndex;

#[derive(Parser)]
#[command(about = "Echoman pipeline worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop (default).
    Run,
    /// Trigger stage one for a period key (e.g. 2025-11-07_AM).
    EventMerge { period: String },
    /// Trigger stage two for a period key.
    GlobalMerge { period: String },
    /// Re-upsert missing vectors from the relational ground truth.
    Reconcile,
    /// Ask a question against the topic corpus and stream the answer.
    Ask {
        query: String,
        /// Restrict to one topic.
        #[arg(long)]
        topic_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("echoman=info".parse()?))
        .init();

    info!("Echoman worker starting...");
    dotenv_load();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    echoman_store::migrate(&pool).await?;

    let vectors = VectorIndex::new(pool.clone(), config.embedding_dimension);
    vectors.ensure_schema().await?;

    let llm = Arc::new(
        OpenAi::new(&config.llm_api_key, &config.llm_base_url, &config.llm_model)
            .with_chat_timeout(Duration::from_secs(config.llm_timeout_secs)),
    );
    let embedder = Arc::new(
        OpenAi::new(
            &config.embedding_api_key,
            &config.embedding_base_url,
            &config.llm_model,
        )
        .with_embedding_model(&config.embedding_model)
        .with_embed_timeout(Duration::from_secs(config.embedding_timeout_secs)),
    );

    let deps = PipelineDeps::new(
        pool.clone(),
        config.clone(),
        llm,
        embedder.clone(),
        vectors.clone(),
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => scheduler::run_scheduler(deps).await,
        Command::EventMerge { period } => {
            let period: PeriodKey = period.parse()?;
            let outcome = echoman_pipeline::run_event_merge(&deps, period).await?;
            info!(
                kept = outcome.kept_items,
                dropped = outcome.dropped_items,
                groups = outcome.merge_groups,
                "Stage one trigger complete"
            );
            Ok(())
        }
        Command::GlobalMerge { period } => {
            let period: PeriodKey = period.parse()?;
            let outcome = echoman_pipeline::run_global_merge(&deps, period).await?;
            info!(
                merged = outcome.merge_count,
                created = outcome.new_count,
                failed = outcome.failed_groups,
                "Stage two trigger complete"
            );
            Ok(())
        }
        Command::Reconcile => {
            let outcome = echoman_pipeline::reconcile_vectors(&deps).await?;
            info!(
                summaries_repaired = outcome.summaries_repaired,
                item_vectors_repaired = outcome.item_vectors_repaired,
                "Reconciliation complete"
            );
            Ok(())
        }
        Command::Ask { query, topic_id } => {
            // The RAG call path gets its own provider with the longer timeout.
            let rag_llm = Arc::new(
                OpenAi::new(&config.llm_api_key, &config.llm_base_url, &config.llm_model)
                    .with_chat_timeout(Duration::from_secs(config.rag_timeout_secs)),
            );
            let reader = RagReader::new(pool, &config, rag_llm, embedder, vectors);
            let mode = match topic_id {
                Some(topic_id) => RagMode::Topic { topic_id },
                None => RagMode::Global,
            };
            let mut stream = reader.ask_stream(&query, mode);
            while let Some(event) = stream.next().await {
                println!("{}", serde_json::to_string(&event)?);
                if event.is_terminal() {
                    break;
                }
            }
            Ok(())
        }
    }
}

fn dotenv_load() {
    let path = std::path::Path::new(".env");
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if std::env::var(key.trim()).is_err() {
                    std::env::set_var(key.trim(), value.trim());
                }
            }
        }
    }
}
