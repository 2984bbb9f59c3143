//! The typed event sequence a RAG answer streams: zero or more `token`
//! events, at most one `citations`, then exactly one terminal event from
//! {`done`, `error`}. The transport serializes these verbatim.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RagEvent {
    Token { content: String },
    Citations { citations: Vec<Citation> },
    Done { diagnostics: Diagnostics },
    Error { message: String },
}

impl RagEvent {
    /// Terminal events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RagEvent::Done { .. } | RagEvent::Error { .. })
    }
}

/// One recalled evidence source, surfaced to the client after the answer.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub platform: String,
    pub snippet: String,
    pub topic_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub latency_ms: i64,
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub context_chunks: usize,
    pub fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = RagEvent::Token {
            content: "王传君".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "王传君");
    }

    #[test]
    fn done_carries_diagnostics() {
        let event = RagEvent::Done {
            diagnostics: Diagnostics {
                latency_ms: 1200,
                tokens_prompt: 800,
                tokens_completion: 150,
                context_chunks: 4,
                fallback: false,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["diagnostics"]["context_chunks"], 4);
        assert_eq!(json["diagnostics"]["fallback"], false);
    }

    #[test]
    fn terminal_classification() {
        assert!(RagEvent::Done {
            diagnostics: Diagnostics::default()
        }
        .is_terminal());
        assert!(RagEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
        assert!(!RagEvent::Token {
            content: String::new()
        }
        .is_terminal());
        assert!(!RagEvent::Citations {
            citations: Vec::new()
        }
        .is_terminal());
    }
}
