//! OpenPhish plaintext feed
//!
//! 改行区切りのURLリスト。掲載済みURLは検証済みとみなし、固定の高い信頼度を付与する。

use super::{content_lines, ThreatFeedProvider};
use crate::threat_intelligence::classifier::RuleBook;
use crate::threat_intelligence::transport::FeedClient;
use crate::threat_intelligence::types::{ThreatError, ThreatKind, ThreatRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const PROVIDER_NAME: &str = "OpenPhish";
const SOURCE_TAG: &str = "openphish";

/// OpenPhish プロバイダー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenPhishConfig {
    pub enabled: bool,
    pub feed_url: String,
    /// 先頭から取り込む最大件数（フィードは新しい順）
    pub max_entries: usize,
    pub confidence: u8,
}

impl Default for OpenPhishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: "https://openphish.com/feed.txt".to_string(),
            max_entries: 500,
            confidence: 90,
        }
    }
}

/// OpenPhish プロバイダー
pub struct OpenPhishProvider {
    config: OpenPhishConfig,
    client: Arc<FeedClient>,
    rules: Arc<RuleBook>,
}

impl OpenPhishProvider {
    pub fn new(
        config: OpenPhishConfig,
        client: Arc<FeedClient>,
        rules: Arc<RuleBook>,
    ) -> Result<Self, ThreatError> {
        if config.feed_url.trim().is_empty() {
            return Err(ThreatError::ConfigurationError(
                "OpenPhish feed_url is required".to_string(),
            ));
        }

        Ok(Self {
            config,
            client,
            rules,
        })
    }

    /// フィード本文をパース
    pub fn parse_feed(&self, body: &str, now: DateTime<Utc>) -> Vec<ThreatRecord> {
        content_lines(body)
            .take(self.config.max_entries)
            .filter_map(|line| {
                let record = ThreatRecord::from_url(PROVIDER_NAME, line, ThreatKind::Phishing);
                if record.is_none() {
                    warn!(provider = PROVIDER_NAME, line, "Skipping unparseable URL");
                }
                record
            })
            .map(|record| {
                let description = self.rules.phishing_description(&record.indicator);
                let line = record.indicator.clone();
                record
                    .with_confidence(i64::from(self.config.confidence))
                    .with_first_seen(now)
                    .with_tags([SOURCE_TAG, "phishing"])
                    .with_description(description)
                    .with_raw_data(json!({ "line": line }))
            })
            .collect()
    }
}

#[async_trait]
impl ThreatFeedProvider for OpenPhishProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(&self) -> Result<Vec<ThreatRecord>, ThreatError> {
        let body = self.client.fetch_text(&self.config.feed_url).await?;
        let records = self.parse_feed(&body, Utc::now());
        info!(provider = PROVIDER_NAME, count = records.len(), "Ingested threats");
        Ok(records)
    }
}
