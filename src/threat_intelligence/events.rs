//! Ingestion Events
//!
//! スケジューラーの状態変化とサイクル結果を通知システムへ配信する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_BUFFER_SIZE: usize = 256;

/// 取り込みイベント
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: IngestionEventKind,
}

/// イベントの種類
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestionEventKind {
    SchedulerStarted { interval_secs: u64 },
    SchedulerStopped,
    CycleCompleted {
        cycle_id: Uuid,
        total_ingested: usize,
        failed_providers: Vec<String>,
    },
    /// 前のサイクルが実行中のためタイマーの1回分を見送った
    CycleSkipped,
    CycleFailed { message: String },
}

/// イベント配信チャンネル
#[derive(Clone)]
pub struct IngestionEvents {
    tx: broadcast::Sender<IngestionEvent>,
}

impl Default for IngestionEvents {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl IngestionEvents {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestionEvent> {
        self.tx.subscribe()
    }

    /// イベントを発行（受信者がいない場合もエラーにしない）
    pub fn publish(&self, kind: IngestionEventKind) {
        let event = IngestionEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        };

        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(receivers, "Published ingestion event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let events = IngestionEvents::default();
        let mut rx = events.subscribe();

        events.publish(IngestionEventKind::CycleFailed {
            message: "boom".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            IngestionEventKind::CycleFailed {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_publish_without_receivers() {
        IngestionEvents::new(4).publish(IngestionEventKind::SchedulerStopped);
    }

    #[test]
    fn test_event_serialization() {
        let kind = IngestionEventKind::SchedulerStarted { interval_secs: 60 };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "scheduler_started");
        assert_eq!(json["interval_secs"], 60);
    }
}
