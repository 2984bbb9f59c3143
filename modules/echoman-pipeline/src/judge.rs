//! LLM adjudication: event-group confirmation (stage one) and topic
//! association (stage two). Both calls are token-bounded, audited, and
//! return closed decision types.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use ai_client::budget::{estimate_tokens, truncate_to_tokens};
use ai_client::{retry, ChatMessage, ChatOptions};
use echoman_common::{EchomanError, PeriodKey};
use echoman_store::{JudgementKind, NewJudgement, SourceItem};

use crate::deps::PipelineDeps;

const MAX_TITLE_TOKENS: usize = 80;
const MAX_ITEM_SUMMARY_TOKENS: usize = 150;
const MAX_CANDIDATE_SUMMARY_TOKENS: usize = 200;
const MAX_PROMPT_TOKENS: usize = 2_500;
const MAX_COMPLETION_TOKENS: u32 = 300;

const EVENT_SYSTEM_PROMPT: &str =
    "你是专业的新闻事件分析助手，擅长判断不同新闻是否报道同一事件。只输出JSON。";
const ASSOCIATION_SYSTEM_PROMPT: &str =
    "你是专业的新闻事件分析助手，擅长判断事件之间的关联性。只输出JSON。";

/// Stage-one verdict: does this candidate group report one event?
#[derive(Debug, Clone, Deserialize)]
pub struct EventGroupVerdict {
    pub is_same_event: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

/// Stage-two decision, already gated by confidence and target resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicDecision {
    Merge { topic_id: i64, confidence: f64 },
    New { confidence: f64 },
}

/// A recalled topic offered to the association prompt.
#[derive(Debug, Clone)]
pub struct CandidateTopic {
    pub topic_id: i64,
    pub title: String,
    pub summary: String,
    pub last_active: DateTime<Utc>,
    pub echo_length_hours: f64,
    pub similarity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawAssociation {
    #[serde(default)]
    decision: String,
    #[serde(default)]
    target_topic_id: Option<serde_json::Value>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

/// Strip markdown code fences some models wrap around JSON output.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_start_matches('\n').trim_end_matches('`').trim()
}

pub fn parse_event_verdict(content: &str) -> Result<EventGroupVerdict, EchomanError> {
    serde_json::from_str(strip_code_fence(content))
        .map_err(|e| EchomanError::MalformedResponse(format!("event verdict: {e}")))
}

fn parse_association(content: &str) -> Result<RawAssociation, EchomanError> {
    serde_json::from_str(strip_code_fence(content))
        .map_err(|e| EchomanError::MalformedResponse(format!("association decision: {e}")))
}

/// Resolve the model's `target_topic_id` to a real candidate topic id.
/// Accepts the id itself, a 1-based ordinal into the candidate list, the
/// same as a float, or a string carrying digits. Anything else is None.
pub fn resolve_target_topic_id(
    raw: Option<&serde_json::Value>,
    candidate_ids: &[i64],
) -> Option<i64> {
    let resolve_int = |value: i64| -> Option<i64> {
        if candidate_ids.contains(&value) {
            return Some(value);
        }
        if value >= 1 && (value as usize) <= candidate_ids.len() {
            return Some(candidate_ids[value as usize - 1]);
        }
        None
    };

    match raw? {
        serde_json::Value::Number(n) => {
            let value = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            resolve_int(value)
        }
        serde_json::Value::String(s) => {
            // First contiguous digit run only; later digit groups in the
            // string are noise.
            let digits: String = s
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            resolve_int(digits.parse().ok()?)
        }
        _ => None,
    }
}

pub struct Adjudicator<'a> {
    deps: &'a PipelineDeps,
}

impl<'a> Adjudicator<'a> {
    pub fn new(deps: &'a PipelineDeps) -> Self {
        Self { deps }
    }

    /// Confirm whether a candidate group of items reports the same event.
    pub async fn confirm_event_group(
        &self,
        items: &[&SourceItem],
    ) -> Result<EventGroupVerdict> {
        let mut lines = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let title = truncate_to_tokens(&item.title, MAX_TITLE_TOKENS);
            let summary = if item.summary.is_empty() {
                "无".to_string()
            } else {
                truncate_to_tokens(&item.summary, MAX_ITEM_SUMMARY_TOKENS)
            };
            lines.push(format!(
                "[条目 {}] 标题: {}  摘要: {}  平台: {}  时间: {}",
                idx + 1,
                title,
                summary,
                item.platform,
                item.fetched_at.format("%H:%M"),
            ));
        }

        let prompt = format!(
            "判断以下新闻条目是否为同一事件的不同报道（同一归并周期内采集）：\n\n{}\n\n\
             要求输出 JSON 格式：\n{{\n  \"is_same_event\": true/false,\n  \
             \"confidence\": 0.0-1.0,\n  \"reason\": \"判断理由\"\n}}",
            lines.join("\n"),
        );
        let prompt = self.cap_prompt(prompt);

        let request = json!({
            "items": items.iter().map(|i| json!({"id": i.id, "title": i.title})).collect::<Vec<_>>(),
        });

        let content = self
            .call(EVENT_SYSTEM_PROMPT, prompt, JudgementKind::EventMerge, request)
            .await?;
        parse_event_verdict(&content).map_err(Into::into)
    }

    /// Decide whether an event group continues one of the candidate topics.
    pub async fn decide_topic_association(
        &self,
        representative: &SourceItem,
        candidates: &[CandidateTopic],
        period: PeriodKey,
    ) -> Result<TopicDecision> {
        if candidates.is_empty() {
            return Ok(TopicDecision::New { confidence: 1.0 });
        }

        let title = truncate_to_tokens(&representative.title, MAX_TITLE_TOKENS);
        let summary = if representative.summary.is_empty() {
            "无".to_string()
        } else {
            truncate_to_tokens(&representative.summary, MAX_ITEM_SUMMARY_TOKENS)
        };

        let mut blocks = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            let cand_summary = truncate_to_tokens(&candidate.summary, MAX_CANDIDATE_SUMMARY_TOKENS);
            blocks.push(format!(
                "【候选主题 {}】\n主题ID: {}\n标题: {}\n摘要: {}\n最后活跃: {}\n持续时长: {:.1} 小时",
                idx + 1,
                candidate.topic_id,
                truncate_to_tokens(&candidate.title, MAX_TITLE_TOKENS),
                cand_summary,
                candidate.last_active.format("%Y-%m-%d %H:%M"),
                candidate.echo_length_hours,
            ));
        }

        let prompt = format!(
            "判断新事件是否为已有主题的新进展：\n\n【新事件】\n标题: {}\n摘要: {}\n平台: {}\n\
             日期: {} {}\n\n{}\n\n要求输出 JSON 格式：\n{{\n  \"decision\": \"merge\" 或 \"new\",\n  \
             \"target_topic_id\": 候选主题的真实主题ID（数字）,\n  \"confidence\": 0.0-1.0,\n  \
             \"reason\": \"判断理由\"\n}}\n\n判断标准：\n\
             1. 新事件是某候选主题的后续进展或新报道时选择 \"merge\"\n\
             2. 与所有候选主题都无关时选择 \"new\"\n3. 主题一致性必须强",
            title,
            summary,
            representative.platform,
            period.date,
            period.period,
            blocks.join("\n\n"),
        );
        let prompt = self.cap_prompt(prompt);

        let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.topic_id).collect();
        let request = json!({
            "item_id": representative.id,
            "candidates": candidate_ids,
        });

        let content = self
            .call(
                ASSOCIATION_SYSTEM_PROMPT,
                prompt,
                JudgementKind::GlobalMerge,
                request,
            )
            .await?;
        let raw = parse_association(&content)?;

        let resolved = resolve_target_topic_id(raw.target_topic_id.as_ref(), &candidate_ids);
        let threshold = self.deps.config.global_merge_confidence_threshold;

        match (raw.decision.as_str(), resolved) {
            ("merge", Some(topic_id)) if raw.confidence >= threshold => {
                info!(topic_id, confidence = raw.confidence, reason = %raw.reason, "association: merge");
                Ok(TopicDecision::Merge {
                    topic_id,
                    confidence: raw.confidence,
                })
            }
            _ => {
                info!(confidence = raw.confidence, decision = %raw.decision, "association: new");
                Ok(TopicDecision::New {
                    confidence: raw.confidence,
                })
            }
        }
    }

    fn cap_prompt(&self, prompt: String) -> String {
        let tokens = estimate_tokens(&prompt);
        if tokens > MAX_PROMPT_TOKENS {
            warn!(tokens, limit = MAX_PROMPT_TOKENS, "adjudication prompt over budget, truncating");
            truncate_to_tokens(&prompt, MAX_PROMPT_TOKENS)
        } else {
            prompt
        }
    }

    /// Shared call path: gate, retry at the provider edge, audit row.
    async fn call(
        &self,
        system: &str,
        prompt: String,
        kind: JudgementKind,
        request: serde_json::Value,
    ) -> Result<String> {
        let _permit = self.deps.provider_gate.acquire().await?;

        let messages = vec![ChatMessage::system(system), ChatMessage::user(prompt)];
        let opts = ChatOptions {
            temperature: Some(0.3),
            max_tokens: Some(MAX_COMPLETION_TOKENS),
            json_response: true,
        };

        let outcome = retry::with_backoff(kind.as_str(), self.deps.config.llm_max_retries, || {
            self.deps.llm.chat(messages.clone(), opts.clone())
        })
        .await;

        let (status, response, usage) = match &outcome {
            Ok(o) => (
                "success",
                serde_json::from_str(strip_code_fence(&o.content)).ok(),
                Some(o.usage),
            ),
            Err(e) => {
                warn!(kind = %kind, error = %e, "adjudication call failed");
                ("failed", Some(json!({"error": e.to_string()})), None)
            }
        };

        let judgement = NewJudgement {
            kind,
            status,
            request,
            response,
            tokens_prompt: usage.map(|u| u.prompt_tokens as i32),
            tokens_completion: usage.map(|u| u.completion_tokens as i32),
            provider: self.deps.llm.provider_name().to_string(),
            model: self.deps.llm.model().to_string(),
        };
        if let Err(e) = judgement.insert(&self.deps.pool).await {
            warn!(error = %e, "failed to record llm judgement");
        }

        let outcome = outcome.map_err(|e| EchomanError::Llm(e.to_string()))?;
        Ok(outcome.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_verdict() {
        let v = parse_event_verdict(
            r#"{"is_same_event": true, "confidence": 0.92, "reason": "同一颁奖事件"}"#,
        )
        .unwrap();
        assert!(v.is_same_event);
        assert!((v.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn parses_fenced_verdict() {
        let v = parse_event_verdict(
            "```json\n{\"is_same_event\": false, \"confidence\": 0.3, \"reason\": \"无关\"}\n```",
        )
        .unwrap();
        assert!(!v.is_same_event);
    }

    #[test]
    fn missing_fields_default() {
        let v = parse_event_verdict(r#"{"is_same_event": true}"#).unwrap();
        assert_eq!(v.confidence, 0.0);
        assert_eq!(v.reason, "");
    }

    #[test]
    fn malformed_verdict_is_an_error() {
        assert!(parse_event_verdict("the items look related").is_err());
        assert!(parse_event_verdict("{\"is_same_event\":").is_err());
    }

    #[test]
    fn resolve_direct_id() {
        let ids = [101, 202, 303];
        let raw = json!(202);
        assert_eq!(resolve_target_topic_id(Some(&raw), &ids), Some(202));
    }

    #[test]
    fn resolve_ordinal() {
        // Models sometimes answer with the candidate's position, not its id.
        let ids = [101, 202, 303];
        assert_eq!(resolve_target_topic_id(Some(&json!(2)), &ids), Some(202));
        assert_eq!(resolve_target_topic_id(Some(&json!(1)), &ids), Some(101));
    }

    #[test]
    fn resolve_float() {
        let ids = [101, 202, 303];
        assert_eq!(resolve_target_topic_id(Some(&json!(101.0)), &ids), Some(101));
        assert_eq!(resolve_target_topic_id(Some(&json!(3.0)), &ids), Some(303));
    }

    #[test]
    fn resolve_string_with_digits() {
        let ids = [101, 202, 303];
        assert_eq!(
            resolve_target_topic_id(Some(&json!("候选主题 2")), &ids),
            Some(202)
        );
        assert_eq!(resolve_target_topic_id(Some(&json!("303")), &ids), Some(303));
    }

    #[test]
    fn resolve_string_takes_first_digit_run() {
        let ids = [101, 202, 303];
        // Only the first digit group counts; trailing groups are noise.
        assert_eq!(
            resolve_target_topic_id(Some(&json!("主题2-候选1")), &ids),
            Some(202)
        );
        assert_eq!(
            resolve_target_topic_id(Some(&json!("101 （而非 303）")), &ids),
            Some(101)
        );
        // Concatenating 30 and 3 would wrongly yield 303.
        assert_eq!(resolve_target_topic_id(Some(&json!("30 和 3")), &ids), None);
    }

    #[test]
    fn resolve_unknown_id_is_none() {
        let ids = [101, 202, 303];
        assert_eq!(resolve_target_topic_id(Some(&json!(999)), &ids), None);
        assert_eq!(resolve_target_topic_id(Some(&json!("no digits")), &ids), None);
        assert_eq!(resolve_target_topic_id(Some(&json!(null)), &ids), None);
        assert_eq!(resolve_target_topic_id(None, &ids), None);
    }

    #[test]
    fn resolve_ordinal_out_of_range_is_none() {
        let ids = [101, 202];
        // 4 is neither a candidate id nor a valid ordinal.
        assert_eq!(resolve_target_topic_id(Some(&json!(4)), &ids), None);
    }

    #[test]
    fn strip_fence_variants() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
