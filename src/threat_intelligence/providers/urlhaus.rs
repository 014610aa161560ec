//! URLhaus CSV feed
//!
//! `#` で始まるメタデータ行とカンマ区切りのレコード行が混在するCSV。
//! 列: id, dateadded, url, url_status, last_online, threat, tags, urlhaus_link, reporter

use super::ThreatFeedProvider;
use crate::threat_intelligence::classifier::RuleBook;
use crate::threat_intelligence::transport::FeedClient;
use crate::threat_intelligence::types::{
    parse_feed_timestamp, ThreatError, ThreatKind, ThreatRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "URLhaus";
const SOURCE_TAG: &str = "urlhaus";

const COL_DATE_ADDED: usize = 1;
const COL_URL: usize = 2;
const COL_STATUS: usize = 3;
const COL_LAST_ONLINE: usize = 4;
const COL_THREAT: usize = 5;
const COL_TAGS: usize = 6;
const MIN_FIELDS: usize = COL_TAGS + 1;

/// マルウェアファミリーとして扱わない汎用タグ
const GENERIC_TAGS: &[&str] = &[
    "32-bit", "64-bit", "arm", "elf", "exe", "dll", "doc", "js", "mips", "mipsel", "opendir",
    "powershell", "sh", "zip",
];

/// URLhaus プロバイダー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlhausConfig {
    pub enabled: bool,
    pub feed_url: String,
    /// 1サイクルで取り込む最大レコード数
    pub max_records: usize,
    pub confidence: u8,
}

impl Default for UrlhausConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: "https://urlhaus.abuse.ch/downloads/csv_recent/".to_string(),
            max_records: 1000,
            confidence: 85,
        }
    }
}

/// URLhaus プロバイダー
pub struct UrlhausProvider {
    config: UrlhausConfig,
    client: Arc<FeedClient>,
    rules: Arc<RuleBook>,
}

impl UrlhausProvider {
    pub fn new(
        config: UrlhausConfig,
        client: Arc<FeedClient>,
        rules: Arc<RuleBook>,
    ) -> Result<Self, ThreatError> {
        if config.feed_url.trim().is_empty() {
            return Err(ThreatError::ConfigurationError(
                "URLhaus feed_url is required".to_string(),
            ));
        }

        Ok(Self {
            config,
            client,
            rules,
        })
    }

    /// CSV本文をパース
    ///
    /// 引用符内の改行を含むフィールドもそのまま1レコードとして扱う。
    pub fn parse_csv(&self, body: &str, now: DateTime<Utc>) -> Vec<ThreatRecord> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());

        let mut records = Vec::new();

        for row in reader.records() {
            if records.len() >= self.config.max_records {
                debug!(provider = PROVIDER_NAME, max = self.config.max_records, "Record cap reached");
                break;
            }

            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(provider = PROVIDER_NAME, "Skipping unreadable CSV record: {}", e);
                    continue;
                }
            };

            if let Some(record) = self.parse_row(&row, now) {
                records.push(record);
            }
        }

        records
    }

    fn parse_row(&self, fields: &csv::StringRecord, now: DateTime<Utc>) -> Option<ThreatRecord> {
        if fields.len() < MIN_FIELDS {
            warn!(
                provider = PROVIDER_NAME,
                fields = fields.len(),
                "Skipping malformed CSV row"
            );
            return None;
        }

        let status = fields[COL_STATUS].trim();
        if !status.eq_ignore_ascii_case("online") {
            return None;
        }

        let url = fields[COL_URL].trim();
        if url.is_empty() {
            return None;
        }

        let threat_label = fields[COL_THREAT].trim();
        let threat_kind = self.rules.threat_labels.classify(threat_label);

        let Some(record) = ThreatRecord::from_url(PROVIDER_NAME, url, threat_kind) else {
            warn!(provider = PROVIDER_NAME, url, "Skipping unparseable URL");
            return None;
        };

        let feed_tags: Vec<&str> = fields[COL_TAGS]
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .collect();

        let malware_family = feed_tags
            .iter()
            .find(|tag| !GENERIC_TAGS.contains(&tag.to_lowercase().as_str()))
            .map(|tag| tag.to_string())
            .filter(|_| threat_kind != ThreatKind::Phishing);

        let first_seen = parse_feed_timestamp(&fields[COL_DATE_ADDED]).unwrap_or(now);
        let last_seen = parse_feed_timestamp(&fields[COL_LAST_ONLINE]);

        let label = if threat_label.is_empty() {
            threat_kind.as_str()
        } else {
            threat_label
        };
        let description = format!(
            "{} URL reported by URLhaus ({})",
            threat_kind.display_name(),
            label
        );

        let mut tags = vec![SOURCE_TAG, label];
        tags.extend(feed_tags.iter().copied());

        Some(
            record
                .with_confidence(i64::from(self.config.confidence))
                .with_first_seen(first_seen)
                .with_last_seen(last_seen)
                .with_malware_family(malware_family)
                .with_tags(tags)
                .with_description(description)
                .with_raw_data(json!({ "fields": fields.iter().collect::<Vec<_>>() })),
        )
    }
}

#[async_trait]
impl ThreatFeedProvider for UrlhausProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(&self) -> Result<Vec<ThreatRecord>, ThreatError> {
        let body = self.client.fetch_text(&self.config.feed_url).await?;
        let records = self.parse_csv(&body, Utc::now());
        info!(provider = PROVIDER_NAME, count = records.len(), "Ingested threats");
        Ok(records)
    }
}
