//! Threat Intelligence Ingestion Module
//!
//! 外部の脅威フィード（URLリスト・CSV・JSONパルス・ローカルコーパス）を定期的に取り込み、
//! 共通の `ThreatRecord` に正規化して永続化層へ渡す。

pub mod aggregator;
pub mod classifier;
pub mod events;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;

// 主要な型と構造体の再エクスポート
pub use aggregator::{dedup_records, IngestionConfig, IngestionService, IngestionSummary, ProviderReport};
pub use classifier::{KeywordRule, RuleBook, RuleTable};
pub use events::{IngestionEvent, IngestionEventKind, IngestionEvents};
pub use providers::*;
pub use scheduler::{IngestionScheduler, SchedulerConfig, SchedulerStatus};
pub use store::{InMemoryThreatStore, ThreatStore, UpsertOutcome};
pub use transport::{extract_domain, with_timeout, FeedClient, RetryPolicy};
pub use types::*;
