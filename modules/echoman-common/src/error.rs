use thiserror::Error;

#[derive(Error, Debug)]
pub enum EchomanError {
    #[error("database error: {0}")]
    Database(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("malformed llm response: {0}")]
    MalformedResponse(String),

    #[error("vector index error: {0}")]
    VectorIndex(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no items pending in period {0}")]
    EmptyPeriod(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
