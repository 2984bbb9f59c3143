use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use ai_client::{ChatProvider, EmbedAgent};
use echoman_common::{Config, Platform};
use echoman_vector::VectorIndex;

use crate::ingest::SourceItemDraft;

/// External hook: produces normalized drafts for one platform when the
/// scheduled ingestion slot fires. Scrapers live outside the core; the core
/// only defines the shape it consumes.
#[async_trait]
pub trait ItemSource: Send + Sync {
    fn platform(&self) -> Platform;
    async fn fetch(&self, run_id: &str) -> Result<Vec<SourceItemDraft>>;
}

/// External hook: assigns a category label to a freshly created topic.
/// Failure never blocks topic creation.
#[async_trait]
pub trait TopicClassifier: Send + Sync {
    /// Returns (category, confidence, method).
    async fn classify(&self, title: &str, node_texts: &[String]) -> Result<(String, f64, String)>;
}

/// Everything a pipeline stage needs. The providers are stateless and shared;
/// transactional state is never shared across concurrent group handlers.
#[derive(Clone)]
pub struct PipelineDeps {
    pub pool: PgPool,
    pub config: Config,
    pub llm: Arc<dyn ChatProvider>,
    pub embedder: Arc<dyn EmbedAgent>,
    pub vectors: VectorIndex,
    /// Bounds concurrent LLM + embedding calls process-wide.
    pub provider_gate: Arc<Semaphore>,
    pub classifier: Option<Arc<dyn TopicClassifier>>,
    pub sources: Vec<Arc<dyn ItemSource>>,
}

impl PipelineDeps {
    pub fn new(
        pool: PgPool,
        config: Config,
        llm: Arc<dyn ChatProvider>,
        embedder: Arc<dyn EmbedAgent>,
        vectors: VectorIndex,
    ) -> Self {
        let gate = Arc::new(Semaphore::new(config.llm_max_concurrent.max(1)));
        Self {
            pool,
            config,
            llm,
            embedder,
            vectors,
            provider_gate: gate,
            classifier: None,
            sources: Vec::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn TopicClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn ItemSource>) -> Self {
        self.sources.push(source);
        self
    }
}
