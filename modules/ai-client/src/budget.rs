//! Token accounting for prompt assembly.
//!
//! Counting uses a conservative two-characters-per-token estimate, which
//! over-counts CJK-heavy text slightly and keeps prompts comfortably inside
//! the model envelope without a tokenizer dependency.

/// Minimum tokens worth keeping when truncating the final context chunk.
/// A smaller tail carries no usable evidence.
const MIN_TAIL_TOKENS: usize = 100;

/// Estimate the token count of a text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 2).max(1)
    }
}

/// Truncate text to at most `max_tokens` including the appended ellipsis
/// marker. Returns the text unchanged when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }

    // The "..." marker costs ~2 tokens; keep the result within budget.
    let body_budget = max_tokens.saturating_sub(2);
    let chars: Vec<char> = text.chars().collect();
    let mut keep = (body_budget * 2).min(chars.len());
    while keep > 0 && estimate_tokens(&chars[..keep].iter().collect::<String>()) > body_budget {
        keep = keep * 9 / 10;
    }

    let mut out: String = chars[..keep].iter().collect();
    out.push_str("...");
    out
}

/// Context chunks selected by [`TokenBudget::pack_chunks`].
#[derive(Debug, Clone)]
pub struct PackedContext {
    pub chunks: Vec<String>,
    pub used_tokens: usize,
    pub truncated_last: bool,
}

/// Budget arithmetic against a fixed model context envelope.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub context_limit: usize,
    pub safety_margin: usize,
}

impl TokenBudget {
    pub fn new(context_limit: usize, safety_margin: usize) -> Self {
        Self {
            context_limit,
            safety_margin,
        }
    }

    /// Tokens left for retrieved context after the system prompt, the query,
    /// the completion reservation, and the safety margin.
    pub fn available_context_tokens(
        &self,
        system_prompt: &str,
        query: &str,
        max_completion_tokens: usize,
    ) -> usize {
        let used = estimate_tokens(system_prompt)
            + estimate_tokens(query)
            + max_completion_tokens
            + self.safety_margin;
        self.context_limit.saturating_sub(used)
    }

    /// Pack whole chunks in order until the budget would be exceeded.
    /// Only the last chunk may be truncated, and only when at least
    /// `MIN_TAIL_TOKENS` of budget remain for it.
    pub fn pack_chunks(&self, chunks: &[String], available_tokens: usize) -> PackedContext {
        let mut packed = Vec::new();
        let mut used = 0usize;
        let mut truncated_last = false;

        for chunk in chunks {
            let cost = estimate_tokens(chunk);
            if used + cost <= available_tokens {
                packed.push(chunk.clone());
                used += cost;
                continue;
            }

            let remaining = available_tokens.saturating_sub(used);
            if remaining >= MIN_TAIL_TOKENS {
                let tail = truncate_to_tokens(chunk, remaining);
                used += estimate_tokens(&tail);
                packed.push(tail);
                truncated_last = true;
            }
            break;
        }

        PackedContext {
            chunks: packed,
            used_tokens: used,
            truncated_last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_half_char_count() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 4);
        // CJK counts by chars, not bytes
        assert_eq!(estimate_tokens("热点新闻"), 2);
    }

    #[test]
    fn estimate_floors_at_one_for_nonempty() {
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[test]
    fn truncate_noop_when_fitting() {
        assert_eq!(truncate_to_tokens("short", 100), "short");
    }

    #[test]
    fn truncate_shrinks_and_marks() {
        let long = "x".repeat(400);
        let out = truncate_to_tokens(&long, 50);
        assert!(out.ends_with("..."));
        assert!(estimate_tokens(out.trim_end_matches("...")) <= 50);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "热".repeat(300);
        let out = truncate_to_tokens(&long, 20);
        assert!(out.ends_with("..."));
        assert!(out.trim_end_matches("...").chars().all(|c| c == '热'));
    }

    #[test]
    fn available_subtracts_everything() {
        let budget = TokenBudget::new(32_000, 2_000);
        let system = "s".repeat(200); // 100 tokens
        let query = "q".repeat(100); // 50 tokens
        let available = budget.available_context_tokens(&system, &query, 2_000);
        assert_eq!(available, 32_000 - 2_000 - 100 - 50 - 2_000);
    }

    #[test]
    fn available_saturates_at_zero() {
        let budget = TokenBudget::new(1_000, 2_000);
        assert_eq!(budget.available_context_tokens("", "", 2_000), 0);
    }

    #[test]
    fn pack_takes_whole_chunks_in_order() {
        let budget = TokenBudget::new(32_000, 2_000);
        let chunks = vec!["a".repeat(200), "b".repeat(200), "c".repeat(200)];
        let packed = budget.pack_chunks(&chunks, 250);
        // 100 + 100 fit; the third would need 100 more but only 50 remain (< 100 floor).
        assert_eq!(packed.chunks.len(), 2);
        assert_eq!(packed.used_tokens, 200);
        assert!(!packed.truncated_last);
    }

    #[test]
    fn pack_truncates_last_when_tail_is_worthwhile() {
        let budget = TokenBudget::new(32_000, 2_000);
        let chunks = vec!["a".repeat(200), "b".repeat(600)];
        let packed = budget.pack_chunks(&chunks, 250);
        assert_eq!(packed.chunks.len(), 2);
        assert!(packed.truncated_last);
        assert!(packed.chunks[1].ends_with("..."));
        assert!(packed.used_tokens <= 250);
    }

    #[test]
    fn pack_skips_tail_below_floor() {
        let budget = TokenBudget::new(32_000, 2_000);
        let chunks = vec!["a".repeat(380), "b".repeat(600)];
        let packed = budget.pack_chunks(&chunks, 250);
        // 190 used; 60 remain, under the 100-token floor.
        assert_eq!(packed.chunks.len(), 1);
        assert!(!packed.truncated_last);
    }

    #[test]
    fn pack_empty_budget_packs_nothing() {
        let budget = TokenBudget::new(32_000, 2_000);
        let packed = budget.pack_chunks(&["a".repeat(400)], 0);
        assert!(packed.chunks.is_empty());
        assert_eq!(packed.used_tokens, 0);
    }
}
