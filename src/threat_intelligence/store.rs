//! Threat Store
//!
//! 正規化済みレコードの永続化インターフェース。キーは `(source, indicator)`。

use crate::threat_intelligence::types::{ThreatError, ThreatRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// upsert の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// 永続化層
#[async_trait]
pub trait ThreatStore: Send + Sync {
    /// バッチを upsert する。既存レコードは `first_seen` を保持し、
    /// `last_seen` と `confidence` を更新する。
    async fn upsert_batch(&self, records: &[ThreatRecord]) -> Result<UpsertOutcome, ThreatError>;
}

/// メモリ内ストア
#[derive(Default)]
pub struct InMemoryThreatStore {
    records: RwLock<HashMap<(String, String), ThreatRecord>>,
}

impl InMemoryThreatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, source: &str, indicator: &str) -> Option<ThreatRecord> {
        let records = self.records.read().await;
        records
            .get(&(source.to_string(), indicator.to_string()))
            .cloned()
    }

    /// 全レコードのスナップショット
    pub async fn records(&self) -> Vec<ThreatRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ThreatStore for InMemoryThreatStore {
    async fn upsert_batch(&self, records: &[ThreatRecord]) -> Result<UpsertOutcome, ThreatError> {
        let mut stored = self.records.write().await;
        let mut outcome = UpsertOutcome::default();

        for record in records {
            match stored.get_mut(&record.key()) {
                Some(existing) => {
                    existing.last_seen = record.last_seen.or(Some(record.first_seen));
                    existing.confidence = record.confidence;
                    outcome.updated += 1;
                }
                None => {
                    stored.insert(record.key(), record.clone());
                    outcome.inserted += 1;
                }
            }
        }

        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            total = stored.len(),
            "Upserted threat records"
        );

        Ok(outcome)
    }
}
