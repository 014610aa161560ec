//! Ingestion Service
//!
//! 登録された全プロバイダーを並行実行し、結果を統合してストアへ書き込む。
//! 個々のプロバイダーの失敗・タイムアウト・パニックはサイクル全体を止めない。

use crate::threat_intelligence::providers::ThreatFeedProvider;
use crate::threat_intelligence::store::{ThreatStore, UpsertOutcome};
use crate::threat_intelligence::transport::with_timeout;
use crate::threat_intelligence::types::{ThreatError, ThreatRecord};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 取り込み設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// プロバイダーごとのタイムアウト（秒）
    pub provider_timeout_secs: u64,
    /// 同時に実行するプロバイダー数の上限
    pub max_concurrent_providers: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 120,
            max_concurrent_providers: 4,
        }
    }
}

/// プロバイダー単位の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReport {
    pub name: String,
    pub count: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// 1サイクル分の取り込み結果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 重複排除後のレコード数
    pub total_ingested: usize,
    pub per_provider: Vec<ProviderReport>,
    pub duplicates_dropped: usize,
    pub invalid_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<UpsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    #[serde(default)]
    pub records: Vec<ThreatRecord>,
}

impl IngestionSummary {
    /// 失敗したプロバイダー名
    pub fn failed_providers(&self) -> Vec<String> {
        self.per_provider
            .iter()
            .filter(|report| !report.ok)
            .map(|report| report.name.clone())
            .collect()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderReport> {
        self.per_provider.iter().find(|report| report.name == name)
    }
}

/// 取り込みサービス
pub struct IngestionService {
    providers: Vec<Arc<dyn ThreatFeedProvider>>,
    store: Option<Arc<dyn ThreatStore>>,
    provider_timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl IngestionService {
    pub fn new(config: &IngestionConfig) -> Self {
        Self {
            providers: Vec::new(),
            store: None,
            provider_timeout: Duration::from_secs(config.provider_timeout_secs),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_providers.max(1))),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ThreatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn ThreatFeedProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// 全プロバイダーから取り込む
    ///
    /// エラーは返さない。失敗は `ProviderReport` と `store_error` に記録される。
    pub async fn ingest_all_feeds(&self) -> IngestionSummary {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%cycle_id, providers = self.providers.len(), "Starting ingestion cycle");

        let tasks = self.providers.iter().map(|provider| {
            let name = provider.name().to_string();
            let provider = Arc::clone(provider);
            let semaphore = Arc::clone(&self.semaphore);
            let timeout = self.provider_timeout;

            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| ThreatError::ProviderError(e.to_string()))?;
                with_timeout(provider.fetch(), timeout).await
            });

            async move {
                let started = Instant::now();
                let outcome = handle.await;
                (name, outcome, started.elapsed())
            }
        });

        let mut reports = Vec::with_capacity(self.providers.len());
        let mut collected = Vec::new();
        let mut invalid_dropped = 0;

        for (name, outcome, elapsed) in join_all(tasks).await {
            let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

            let result = match outcome {
                Ok(result) => result,
                Err(join_error) => {
                    error!(provider = %name, "Provider task aborted: {}", join_error);
                    Err(ThreatError::ProviderError(format!("task aborted: {}", join_error)))
                }
            };

            match result {
                Ok(records) => {
                    let (valid, invalid): (Vec<_>, Vec<_>) =
                        records.into_iter().partition(ThreatRecord::is_valid);
                    if !invalid.is_empty() {
                        warn!(provider = %name, count = invalid.len(), "Dropping invalid records");
                    }
                    invalid_dropped += invalid.len();

                    debug!(provider = %name, count = valid.len(), duration_ms, "Provider finished");
                    reports.push(ProviderReport {
                        name,
                        count: valid.len(),
                        ok: true,
                        error: None,
                        duration_ms,
                    });
                    collected.extend(valid);
                }
                Err(e) => {
                    warn!(provider = %name, duration_ms, "Provider failed: {}", e);
                    reports.push(ProviderReport {
                        name,
                        count: 0,
                        ok: false,
                        error: Some(e.to_string()),
                        duration_ms,
                    });
                }
            }
        }

        let (records, duplicates_dropped) = dedup_records(collected);

        let mut persisted = None;
        let mut store_error = None;
        if let Some(store) = &self.store {
            match store.upsert_batch(&records).await {
                Ok(outcome) => persisted = Some(outcome),
                Err(e) => {
                    error!(%cycle_id, "Failed to persist ingested records: {}", e);
                    store_error = Some(e.to_string());
                }
            }
        }

        let summary = IngestionSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            total_ingested: records.len(),
            per_provider: reports,
            duplicates_dropped,
            invalid_dropped,
            persisted,
            store_error,
            records,
        };

        info!(
            %cycle_id,
            total = summary.total_ingested,
            duplicates = summary.duplicates_dropped,
            failed = ?summary.failed_providers(),
            "Ingestion cycle finished"
        );

        summary
    }
}

/// `(source, indicator)` で重複排除する
///
/// 同じキーが複数回現れた場合は後のレコードが勝ち、位置は最初の出現を保つ。
/// 戻り値は統合後のレコードと削除した件数。
pub fn dedup_records(records: Vec<ThreatRecord>) -> (Vec<ThreatRecord>, usize) {
    let mut positions: HashMap<(String, String), usize> = HashMap::with_capacity(records.len());
    let mut merged: Vec<ThreatRecord> = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        match positions.entry(record.key()) {
            Entry::Occupied(slot) => {
                merged[*slot.get()] = record;
                dropped += 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(record);
            }
        }
    }

    (merged, dropped)
}
