//! Ingestion Scheduler
//!
//! 一定間隔で取り込みサイクルを実行するバックグラウンドタスクを管理する。
//! 状態は `Stopped` と `Running` の2つ。同時に実行されるサイクルは常に1つまで。

use crate::threat_intelligence::aggregator::{IngestionService, IngestionSummary};
use crate::threat_intelligence::events::{IngestionEvent, IngestionEventKind, IngestionEvents};
use crate::threat_intelligence::types::ThreatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 実行間隔の上限（1年）
pub const MAX_INTERVAL_HOURS: u64 = 24 * 365;

/// スケジューラー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 実行間隔（時間）
    pub interval_hours: u64,
    /// イベントバッファサイズ
    pub event_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            event_buffer_size: 256,
        }
    }
}

/// スケジューラーの状態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    /// 次回実行の目安（実行中のみ、now + interval による概算）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_estimate: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
}

#[derive(Debug, Default)]
struct CycleStats {
    last_completed_at: Option<DateTime<Utc>>,
    cycles_completed: u64,
}

/// タイマータスクと共有する状態
struct Shared {
    service: Arc<IngestionService>,
    events: IngestionEvents,
    /// 実行中サイクルのガード
    cycle_lock: Mutex<()>,
    stats: RwLock<CycleStats>,
}

impl Shared {
    /// サイクルを1回実行する。呼び出し側が `cycle_lock` を保持していること。
    async fn run_cycle(&self) -> Option<IngestionSummary> {
        let service = Arc::clone(&self.service);

        match tokio::spawn(async move { service.ingest_all_feeds().await }).await {
            Ok(summary) => {
                {
                    let mut stats = self.stats.write().await;
                    stats.last_completed_at = Some(summary.finished_at);
                    stats.cycles_completed += 1;
                }

                self.events.publish(IngestionEventKind::CycleCompleted {
                    cycle_id: summary.cycle_id,
                    total_ingested: summary.total_ingested,
                    failed_providers: summary.failed_providers(),
                });
                Some(summary)
            }
            Err(e) => {
                error!("Ingestion cycle aborted: {}", e);
                self.events.publish(IngestionEventKind::CycleFailed {
                    message: e.to_string(),
                });
                None
            }
        }
    }
}

struct TimerTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    interval: Duration,
}

/// 取り込みスケジューラー
///
/// ホストが1つだけ生成し、`Arc` で共有する。
pub struct IngestionScheduler {
    shared: Arc<Shared>,
    timer: RwLock<Option<TimerTask>>,
}

impl IngestionScheduler {
    pub fn new(service: Arc<IngestionService>, events: IngestionEvents) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                events,
                cycle_lock: Mutex::new(()),
                stats: RwLock::new(CycleStats::default()),
            }),
            timer: RwLock::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestionEvent> {
        self.shared.events.subscribe()
    }

    /// 定期実行を開始（初回は即時実行）
    ///
    /// 既に実行中の場合は何もしない。初回だけは実行中のサイクルの完了を待つ。
    pub async fn start(&self, interval: Duration) -> Result<(), ThreatError> {
        if interval.is_zero() {
            return Err(ThreatError::ConfigurationError(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        if interval > Duration::from_secs(MAX_INTERVAL_HOURS * 3600) {
            return Err(ThreatError::ConfigurationError(format!(
                "scheduler interval must not exceed {} hours",
                MAX_INTERVAL_HOURS
            )));
        }

        let mut timer = self.timer.write().await;
        if timer.is_some() {
            info!("Ingestion scheduler already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            tokio::select! {
                _ = token.cancelled() => return,
                _guard = shared.cycle_lock.lock() => {
                    shared.run_cycle().await;
                }
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Ok(_guard) = shared.cycle_lock.try_lock() else {
                            warn!("Previous ingestion cycle still in flight, skipping tick");
                            shared.events.publish(IngestionEventKind::CycleSkipped);
                            continue;
                        };
                        shared.run_cycle().await;
                    }
                }
            }
        });

        *timer = Some(TimerTask {
            handle,
            cancel,
            interval,
        });

        self.shared.events.publish(IngestionEventKind::SchedulerStarted {
            interval_secs: interval.as_secs(),
        });
        info!("Started ingestion scheduler (interval: {}s)", interval.as_secs());
        Ok(())
    }

    pub async fn start_every_hours(&self, hours: u64) -> Result<(), ThreatError> {
        self.start(Duration::from_secs(hours.saturating_mul(3600))).await
    }

    /// 定期実行を停止
    ///
    /// 実行中のサイクルは中断せず完了させる。停止済みの場合は何もしない。
    pub async fn stop(&self) {
        let mut timer = self.timer.write().await;

        if let Some(task) = timer.take() {
            task.cancel.cancel();
            drop(task.handle);
            self.shared.events.publish(IngestionEventKind::SchedulerStopped);
            info!("Stopped ingestion scheduler");
        }
    }

    /// 手動でサイクルを実行
    ///
    /// 実行中のサイクルがあれば完了を待ってから実行する。状態遷移は行わない。
    pub async fn run_ingestion(&self) -> Option<IngestionSummary> {
        let _guard = self.shared.cycle_lock.lock().await;
        self.shared.run_cycle().await
    }

    pub async fn is_running(&self) -> bool {
        self.timer.read().await.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let timer = self.timer.read().await;
        let stats = self.shared.stats.read().await;
        let interval = timer.as_ref().map(|task| task.interval);

        SchedulerStatus {
            running: timer.is_some(),
            next_run_estimate: interval
                .and_then(|i| chrono::Duration::from_std(i).ok())
                .and_then(|i| Utc::now().checked_add_signed(i)),
            interval_secs: interval.map(|i| i.as_secs()),
            last_completed_at: stats.last_completed_at,
            cycles_completed: stats.cycles_completed,
        }
    }
}

impl Drop for IngestionScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.cancel.cancel();
        }
    }
}
