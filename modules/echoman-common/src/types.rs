use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EchomanError;

/// The seven collected platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Weibo,
    Zhihu,
    Toutiao,
    Sina,
    Netease,
    Baidu,
    Hupu,
}

impl Platform {
    pub const ALL: [Platform; 7] = [
        Platform::Weibo,
        Platform::Zhihu,
        Platform::Toutiao,
        Platform::Sina,
        Platform::Netease,
        Platform::Baidu,
        Platform::Hupu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Weibo => "weibo",
            Platform::Zhihu => "zhihu",
            Platform::Toutiao => "toutiao",
            Platform::Sina => "sina",
            Platform::Netease => "netease",
            Platform::Baidu => "baidu",
            Platform::Hupu => "hupu",
        }
    }
}

impl FromStr for Platform {
    type Err = EchomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weibo" => Ok(Platform::Weibo),
            "zhihu" => Ok(Platform::Zhihu),
            "toutiao" => Ok(Platform::Toutiao),
            "sina" => Ok(Platform::Sina),
            "netease" => Ok(Platform::Netease),
            "baidu" => Ok(Platform::Baidu),
            "hupu" => Ok(Platform::Hupu),
            other => Err(EchomanError::Validation(format!(
                "unknown platform: {other}"
            ))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-platform weights applied during the second normalization pass.
pub fn default_platform_weights() -> HashMap<Platform, f64> {
    HashMap::from([
        (Platform::Weibo, 1.2),
        (Platform::Zhihu, 1.1),
        (Platform::Baidu, 1.1),
        (Platform::Toutiao, 1.0),
        (Platform::Netease, 0.9),
        (Platform::Sina, 0.8),
        (Platform::Hupu, 0.8),
    ])
}

/// Pipeline position of a SourceItem. Transitions run strictly forward:
/// pending_event_merge → {discarded | pending_global_merge → merged}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    PendingEventMerge,
    PendingGlobalMerge,
    Merged,
    Discarded,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::PendingEventMerge => "pending_event_merge",
            MergeStatus::PendingGlobalMerge => "pending_global_merge",
            MergeStatus::Merged => "merged",
            MergeStatus::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MergeStatus::Merged | MergeStatus::Discarded)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MergeStatus) -> bool {
        matches!(
            (self, next),
            (
                MergeStatus::PendingEventMerge,
                MergeStatus::PendingGlobalMerge | MergeStatus::Discarded
            ) | (MergeStatus::PendingGlobalMerge, MergeStatus::Merged)
        )
    }
}

impl FromStr for MergeStatus {
    type Err = EchomanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_event_merge" => Ok(MergeStatus::PendingEventMerge),
            "pending_global_merge" => Ok(MergeStatus::PendingGlobalMerge),
            "merged" => Ok(MergeStatus::Merged),
            "discarded" => Ok(MergeStatus::Discarded),
            other => Err(EchomanError::Validation(format!(
                "unknown merge status: {other}"
            ))),
        }
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two object kinds stored in the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    SourceItem,
    TopicSummary,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::SourceItem => "source_item",
            ObjectKind::TopicSummary => "topic_summary",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trips() {
        for p in Platform::ALL {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
    }

    #[test]
    fn status_forward_transitions_only() {
        use MergeStatus::*;
        assert!(PendingEventMerge.can_transition_to(PendingGlobalMerge));
        assert!(PendingEventMerge.can_transition_to(Discarded));
        assert!(PendingGlobalMerge.can_transition_to(Merged));

        assert!(!PendingEventMerge.can_transition_to(Merged));
        assert!(!PendingGlobalMerge.can_transition_to(Discarded));
        assert!(!Merged.can_transition_to(PendingEventMerge));
        assert!(!Discarded.can_transition_to(PendingGlobalMerge));
        assert!(!Merged.can_transition_to(Discarded));
    }

    #[test]
    fn terminal_states() {
        assert!(MergeStatus::Merged.is_terminal());
        assert!(MergeStatus::Discarded.is_terminal());
        assert!(!MergeStatus::PendingEventMerge.is_terminal());
        assert!(!MergeStatus::PendingGlobalMerge.is_terminal());
    }

    #[test]
    fn default_weights_cover_all_platforms() {
        let weights = default_platform_weights();
        for p in Platform::ALL {
            assert!(weights.contains_key(&p), "missing weight for {p}");
        }
    }
}
