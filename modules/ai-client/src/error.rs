use thiserror::Error;

#[derive(Error, Debug)]
pub enum AiError {
    /// Non-2xx response from the provider.
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("call timed out after {0}s")]
    Timeout(u64),

    /// The provider answered but the payload is unusable.
    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("provider returned no content")]
    Empty,
}

impl AiError {
    /// Whether a retry at the call edge can plausibly succeed.
    /// Rate limits and server errors are transient; 4xx and malformed
    /// payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AiError::Provider { status, .. } => *status == 429 || *status >= 500,
            AiError::Http(e) => e.is_timeout() || e.is_connect(),
            AiError::Timeout(_) => true,
            AiError::Malformed(_) | AiError::Empty => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_transient() {
        assert!(AiError::Provider { status: 429, message: String::new() }.is_transient());
        assert!(AiError::Provider { status: 503, message: String::new() }.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!AiError::Provider { status: 400, message: String::new() }.is_transient());
        assert!(!AiError::Provider { status: 401, message: String::new() }.is_transient());
        assert!(!AiError::Malformed("bad json".into()).is_transient());
        assert!(!AiError::Empty.is_transient());
    }

    #[test]
    fn timeout_is_transient() {
        assert!(AiError::Timeout(30).is_transient());
    }
}
