pub mod category_metrics;
pub mod embedding;
pub mod judgement;
pub mod migrate;
pub mod period_heat;
pub mod run_record;
pub mod source_item;
pub mod summary;
pub mod topic;
pub mod topic_node;

pub use category_metrics::CategoryDayMetrics;
pub use embedding::EmbeddingRecord;
pub use judgement::{JudgementKind, NewJudgement};
pub use migrate::migrate;
pub use period_heat::TopicPeriodHeat;
pub use run_record::{RunKind, RunRecord};
pub use source_item::{NewSourceItem, SourceItem};
pub use summary::{Summary, SummaryMethod};
pub use topic::Topic;
pub use topic_node::{TopicNode, TopicNodeItem};
