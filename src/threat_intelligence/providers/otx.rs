//! AlienVault OTX pulse feed
//!
//! `{ results: [ pulse ] }` 形式のJSON。各パルスは型付きの指標リストを持つ。
//! まず認証不要の公開エンドポイントを試し、失敗時はAPIキー付きのエンドポイントへフォールバックする。

use super::ThreatFeedProvider;
use crate::threat_intelligence::classifier::RuleBook;
use crate::threat_intelligence::transport::FeedClient;
use crate::threat_intelligence::types::{
    parse_feed_timestamp, IndicatorKind, ThreatError, ThreatKind, ThreatRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "AlienVault OTX";
const SOURCE_TAG: &str = "otx";
const API_KEY_HEADER: &str = "X-OTX-API-KEY";

const MIN_CONFIDENCE: i64 = 50;
const MAX_CONFIDENCE: i64 = 95;
const MAX_DESCRIPTION_CHARS: usize = 200;

/// OTX プロバイダー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtxConfig {
    pub enabled: bool,
    pub base_url: String,
    /// 認証付きフォールバック用のAPIキー
    pub api_key: Option<String>,
    pub max_pulses: usize,
    pub max_indicators_per_pulse: usize,
    pub base_confidence: i64,
    /// 信頼度を加点する作成者
    pub reputable_authors: Vec<String>,
}

impl Default for OtxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://otx.alienvault.com".to_string(),
            api_key: std::env::var("OTX_API_KEY").ok().filter(|k| !k.is_empty()),
            max_pulses: 20,
            max_indicators_per_pulse: 50,
            base_confidence: 70,
            reputable_authors: vec!["AlienVault".to_string()],
        }
    }
}

/// OTX パルス
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OtxPulse {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub author_name: Option<String>,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub tags: Vec<String>,
    /// 文字列または `{ "display_name": ... }` の配列
    pub malware_families: Vec<Value>,
    pub subscriber_count: Option<u64>,
    pub upvotes_count: Option<u64>,
    pub downvotes_count: Option<u64>,
    /// 1件ずつデコードするため生のまま保持
    pub indicators: Vec<Value>,
}

/// OTX 指標
#[derive(Debug, Clone, Deserialize)]
pub struct OtxIndicator {
    pub indicator: String,
    #[serde(rename = "type")]
    pub indicator_type: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl OtxPulse {
    fn family_names(&self) -> Vec<String> {
        self.malware_families
            .iter()
            .filter_map(|family| match family {
                Value::String(name) => Some(name.clone()),
                Value::Object(obj) => obj
                    .get("display_name")
                    .or_else(|| obj.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .filter(|name| !name.trim().is_empty())
            .collect()
    }
}

/// OTXの指標タイプ文字列を対応する種類に変換（未対応は `None`）
pub fn map_indicator_type(indicator_type: &str) -> Option<IndicatorKind> {
    match indicator_type {
        "URL" | "URI" => Some(IndicatorKind::Url),
        "domain" | "hostname" => Some(IndicatorKind::Domain),
        "IPv4" | "IPv6" => Some(IndicatorKind::Ip),
        "FileHash-MD5" | "FileHash-SHA1" | "FileHash-SHA256" => Some(IndicatorKind::Hash),
        _ => None,
    }
}

/// OTX プロバイダー
pub struct OtxProvider {
    config: OtxConfig,
    client: Arc<FeedClient>,
    rules: Arc<RuleBook>,
}

impl OtxProvider {
    pub fn new(
        config: OtxConfig,
        client: Arc<FeedClient>,
        rules: Arc<RuleBook>,
    ) -> Result<Self, ThreatError> {
        if config.base_url.trim().is_empty() {
            return Err(ThreatError::ConfigurationError(
                "OTX base_url is required".to_string(),
            ));
        }

        Ok(Self {
            config,
            client,
            rules,
        })
    }

    fn public_url(&self) -> String {
        format!(
            "{}/api/v1/pulses/activity?limit={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.max_pulses
        )
    }

    fn authenticated_url(&self) -> String {
        format!(
            "{}/api/v1/pulses/subscribed?limit={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.max_pulses
        )
    }

    /// 公開エンドポイントからパルスを取得
    async fn fetch_public(&self) -> Result<Vec<OtxPulse>, ThreatError> {
        let body = self.client.fetch_text(&self.public_url()).await?;
        parse_pulses(&body)
    }

    /// APIキー付きエンドポイントからパルスを取得
    async fn fetch_authenticated(&self) -> Result<Vec<OtxPulse>, ThreatError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                ThreatError::ConfigurationError(
                    "OTX API key is required for the authenticated endpoint".to_string(),
                )
            })?;

        let response = self
            .client
            .fetch_with_retry_headers(&self.authenticated_url(), &[(API_KEY_HEADER, api_key)])
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| ThreatError::NetworkError(e.to_string()))?;
        parse_pulses(&body)
    }

    /// パルス群を正規化済みレコードに変換
    pub fn pulses_to_records(&self, pulses: &[OtxPulse], now: DateTime<Utc>) -> Vec<ThreatRecord> {
        pulses
            .iter()
            .take(self.config.max_pulses)
            .flat_map(|pulse| self.pulse_to_records(pulse, now))
            .collect()
    }

    fn pulse_to_records(&self, pulse: &OtxPulse, now: DateTime<Utc>) -> Vec<ThreatRecord> {
        let families = pulse.family_names();
        let threat_kind = self.classify_pulse(pulse, &families);
        let pulse_created = pulse.created.as_deref().and_then(parse_feed_timestamp);
        let pulse_modified = pulse.modified.as_deref().and_then(parse_feed_timestamp);

        let mut records = Vec::new();
        for raw in pulse.indicators.iter().take(self.config.max_indicators_per_pulse) {
            let indicator: OtxIndicator = match serde_json::from_value(raw.clone()) {
                Ok(indicator) => indicator,
                Err(e) => {
                    warn!(provider = PROVIDER_NAME, pulse = %pulse.name, "Skipping malformed indicator: {}", e);
                    continue;
                }
            };

            let Some(kind) = map_indicator_type(&indicator.indicator_type) else {
                debug!(
                    provider = PROVIDER_NAME,
                    indicator_type = %indicator.indicator_type,
                    "Dropping unsupported indicator type"
                );
                continue;
            };

            let value = indicator.indicator.trim();
            if value.is_empty() {
                warn!(provider = PROVIDER_NAME, pulse = %pulse.name, "Skipping empty indicator");
                continue;
            }

            let record = match kind {
                IndicatorKind::Url => {
                    match ThreatRecord::from_url(PROVIDER_NAME, value, threat_kind) {
                        Some(record) => record,
                        None => {
                            warn!(provider = PROVIDER_NAME, url = value, "Skipping unparseable URL");
                            continue;
                        }
                    }
                }
                IndicatorKind::Domain => ThreatRecord::from_domain(PROVIDER_NAME, value, threat_kind),
                IndicatorKind::Ip | IndicatorKind::Hash => {
                    ThreatRecord::new(PROVIDER_NAME, value, kind, threat_kind)
                }
            };

            let first_seen = indicator
                .created
                .as_deref()
                .and_then(parse_feed_timestamp)
                .or(pulse_created)
                .unwrap_or(now);

            let confidence = self.score_confidence(pulse, first_seen, now);

            let type_tag = indicator.indicator_type.to_lowercase();
            let mut tags = vec![SOURCE_TAG.to_string(), type_tag];
            tags.extend(pulse.tags.iter().cloned());

            let description = self.describe(pulse, &indicator, kind, threat_kind);

            records.push(
                record
                    .with_confidence(confidence)
                    .with_first_seen(first_seen)
                    .with_last_seen(pulse_modified)
                    .with_campaign_name(Some(pulse.name.clone()))
                    .with_malware_family(families.first().cloned())
                    .with_tags(tags)
                    .with_description(description)
                    .with_raw_data(json!({
                        "pulse_id": pulse.id,
                        "pulse_name": pulse.name,
                        "indicator": raw,
                    })),
            );
        }

        records
    }

    /// タグ → マルウェアファミリーの順でキーワード分類
    fn classify_pulse(&self, pulse: &OtxPulse, families: &[String]) -> ThreatKind {
        let table = &self.rules.pulse_tags;
        if let Some(kind) = table.find_any(pulse.tags.iter().map(String::as_str)) {
            return *kind;
        }
        if let Some(kind) = table.find_any(families.iter().map(String::as_str)) {
            return *kind;
        }
        if !families.is_empty() {
            return ThreatKind::Malware;
        }
        table.default
    }

    /// パルスの評判と指標の鮮度から信頼度を算出（50 - 95）
    pub fn score_confidence(&self, pulse: &OtxPulse, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        let mut score = self.config.base_confidence;

        if let Some(author) = pulse.author_name.as_deref() {
            if self
                .config
                .reputable_authors
                .iter()
                .any(|reputable| reputable.eq_ignore_ascii_case(author))
            {
                score += 10;
            }
        }

        match pulse.subscriber_count.unwrap_or(0) {
            n if n > 10_000 => score += 10,
            n if n > 1_000 => score += 5,
            _ => {}
        }

        let up = pulse.upvotes_count.unwrap_or(0);
        let down = pulse.downvotes_count.unwrap_or(0);
        let total = up + down;
        if total >= 5 {
            let ratio = up as f64 / total as f64;
            if ratio >= 0.8 {
                score += 5;
            } else if ratio < 0.5 {
                score -= 5;
            }
        }

        let age = now.signed_duration_since(first_seen);
        if age > Duration::days(30) {
            score -= 10;
        }
        if age > Duration::days(90) {
            score -= 10;
        }

        score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE)
    }

    fn describe(
        &self,
        pulse: &OtxPulse,
        indicator: &OtxIndicator,
        kind: IndicatorKind,
        threat_kind: ThreatKind,
    ) -> String {
        let text = indicator
            .description
            .as_deref()
            .or(pulse.description.as_deref())
            .map(str::trim)
            .filter(|d| !d.is_empty());

        match text {
            Some(text) if text.chars().count() > MAX_DESCRIPTION_CHARS => {
                let truncated: String = text.chars().take(MAX_DESCRIPTION_CHARS).collect();
                format!("{}...", truncated.trim_end())
            }
            Some(text) => text.to_string(),
            None => format!(
                "{} {} indicator from OTX pulse \"{}\"",
                threat_kind.display_name(),
                kind,
                pulse.name
            ),
        }
    }
}

/// パルスエンベロープをパース
///
/// トップレベルが不正なJSONならエラー。個々のパルスは1件ずつデコードし、壊れたものは読み飛ばす。
pub fn parse_pulses(body: &str) -> Result<Vec<OtxPulse>, ThreatError> {
    let envelope: Value =
        serde_json::from_str(body).map_err(|e| ThreatError::ParsingError(e.to_string()))?;

    let results = envelope
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ThreatError::ParsingError("missing `results` array".to_string()))?;

    let pulses = results
        .iter()
        .filter_map(|raw| match serde_json::from_value::<OtxPulse>(raw.clone()) {
            Ok(pulse) => Some(pulse),
            Err(e) => {
                warn!(provider = PROVIDER_NAME, "Skipping malformed pulse: {}", e);
                None
            }
        })
        .collect();

    Ok(pulses)
}

#[async_trait]
impl ThreatFeedProvider for OtxProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(&self) -> Result<Vec<ThreatRecord>, ThreatError> {
        let pulses = match self.fetch_public().await {
            Ok(pulses) => pulses,
            Err(public_err) => {
                warn!(
                    provider = PROVIDER_NAME,
                    "Public pulse endpoint failed, falling back to authenticated endpoint: {}",
                    public_err
                );
                self.fetch_authenticated().await?
            }
        };

        let records = self.pulses_to_records(&pulses, Utc::now());
        info!(
            provider = PROVIDER_NAME,
            pulses = pulses.len(),
            count = records.len(),
            "Ingested threats"
        );
        Ok(records)
    }
}
