use std::collections::HashMap;
use std::env;

use crate::types::{default_platform_weights, Platform};

/// Application configuration loaded from environment variables.
///
/// The timezone is fixed to Asia/Shanghai (`period::CN_TZ`) and is not
/// configurable.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres (relational ground truth + pgvector index)
    pub database_url: String,

    // LLM provider (OpenAI-compatible endpoint)
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    /// Upper bound on concurrent LLM + embedding calls across the process.
    pub llm_max_concurrent: usize,

    // Embedding provider (may share the LLM endpoint)
    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub embedding_timeout_secs: u64,

    // Stage one
    pub halfday_merge_min_occurrence: u32,
    pub halfday_merge_similarity_threshold: f64,
    pub halfday_merge_jaccard_threshold: f64,
    pub halfday_merge_llm_confidence: f64,

    // Stage two
    pub global_merge_topk_candidates: usize,
    pub global_merge_min_similarity: f64,
    pub global_merge_confidence_threshold: f64,
    pub global_merge_max_batch_size: usize,
    pub global_merge_concurrent: usize,
    pub global_merge_new_topic_keep_ratio: f64,
    /// Soft deadline for one pipeline run; the in-flight group finishes,
    /// the remainder is left for the next run.
    pub run_soft_timeout_secs: u64,

    // Summaries
    pub summary_concurrent_size: usize,

    // RAG
    pub rag_context_limit: usize,
    pub rag_safety_margin: usize,
    pub rag_max_completion_tokens: usize,
    pub rag_timeout_secs: u64,

    // Normalization
    pub platform_weights: HashMap<Platform, f64>,

    // Ingestion
    /// Titles containing any of these substrings never enter the store.
    pub noise_title_patterns: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            llm_base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000/v1".to_string()),
            llm_api_key: required_env("LLM_API_KEY"),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "qwen3-32b".to_string()),
            llm_timeout_secs: parsed_env("LLM_TIMEOUT_SECONDS", 30),
            llm_max_retries: parsed_env("LLM_MAX_RETRIES", 3),
            llm_max_concurrent: parsed_env("LLM_MAX_CONCURRENT", 8),
            embedding_base_url: env::var("EMBEDDING_BASE_URL")
                .or_else(|_| env::var("LLM_BASE_URL"))
                .unwrap_or_else(|_| "http://localhost:8000/v1".to_string()),
            embedding_api_key: env::var("EMBEDDING_API_KEY")
                .unwrap_or_else(|_| required_env("LLM_API_KEY")),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "Qwen3-Embedding-8B".to_string()),
            embedding_dimension: parsed_env("EMBEDDING_DIMENSION", 4096),
            embedding_timeout_secs: parsed_env("EMBEDDING_TIMEOUT_SECONDS", 10),
            halfday_merge_min_occurrence: parsed_env("HALFDAY_MERGE_MIN_OCCURRENCE", 2),
            halfday_merge_similarity_threshold: parsed_env(
                "HALFDAY_MERGE_SIMILARITY_THRESHOLD",
                0.80,
            ),
            halfday_merge_jaccard_threshold: parsed_env("HALFDAY_MERGE_JACCARD_THRESHOLD", 0.40),
            halfday_merge_llm_confidence: parsed_env("HALFDAY_MERGE_LLM_CONFIDENCE", 0.80),
            global_merge_topk_candidates: parsed_env("GLOBAL_MERGE_TOPK_CANDIDATES", 3).min(3),
            global_merge_min_similarity: parsed_env("GLOBAL_MERGE_MIN_SIMILARITY", 0.50),
            global_merge_confidence_threshold: parsed_env(
                "GLOBAL_MERGE_CONFIDENCE_THRESHOLD",
                0.75,
            ),
            global_merge_max_batch_size: parsed_env("GLOBAL_MERGE_MAX_BATCH_SIZE", 200),
            global_merge_concurrent: parsed_env("GLOBAL_MERGE_CONCURRENT", 1),
            global_merge_new_topic_keep_ratio: parsed_env("GLOBAL_MERGE_NEW_TOPIC_KEEP_RATIO", 1.0),
            run_soft_timeout_secs: parsed_env("RUN_SOFT_TIMEOUT_SECONDS", 900),
            summary_concurrent_size: parsed_env("SUMMARY_CONCURRENT_SIZE", 5),
            rag_context_limit: parsed_env("RAG_CONTEXT_LIMIT", 32_000),
            rag_safety_margin: parsed_env("RAG_SAFETY_MARGIN", 2_000),
            rag_max_completion_tokens: parsed_env("RAG_MAX_COMPLETION_TOKENS", 2_000),
            rag_timeout_secs: parsed_env("RAG_TIMEOUT_SECONDS", 60),
            platform_weights: platform_weights_from_env(),
            noise_title_patterns: noise_patterns_from_env(),
        }
    }

    /// Log which credentials are present without leaking their values.
    pub fn log_redacted(&self) {
        let vars = [
            ("DATABASE_URL", &self.database_url),
            ("LLM_API_KEY", &self.llm_api_key),
            ("EMBEDDING_API_KEY", &self.embedding_api_key),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
        tracing::info!(model = %self.llm_model, embedding = %self.embedding_model, "providers configured");
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `PLATFORM_WEIGHTS` is a JSON object keyed by platform name. Unknown keys
/// are ignored; unlisted platforms keep their default weight.
fn platform_weights_from_env() -> HashMap<Platform, f64> {
    let mut weights = default_platform_weights();
    if let Ok(raw) = env::var("PLATFORM_WEIGHTS") {
        match serde_json::from_str::<HashMap<String, f64>>(&raw) {
            Ok(parsed) => {
                for (name, weight) in parsed {
                    match name.parse::<Platform>() {
                        Ok(platform) => {
                            weights.insert(platform, weight);
                        }
                        Err(_) => {
                            tracing::warn!(platform = %name, "PLATFORM_WEIGHTS names unknown platform, ignoring");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "PLATFORM_WEIGHTS is not valid JSON, using defaults"),
        }
    }
    weights
}

fn noise_patterns_from_env() -> Vec<String> {
    match env::var("NOISE_TITLE_PATTERNS") {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => vec![
            "点击查看更多实时热点".to_string(),
            "查看更多热搜".to_string(),
            "榜单完整版".to_string(),
        ],
    }
}
