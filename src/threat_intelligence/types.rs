//! Threat Intelligence Types
//!
//! 脅威フィード取り込みで使用される基本的なデータ構造を定義

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 1レコードあたりのタグ上限
pub const MAX_TAGS: usize = 5;

/// 正規化された脅威レコード
///
/// プロバイダーが取り込みサイクルごとに新規作成し、集約サービスへ一度だけ渡す値オブジェクト。
/// 永続化層では `(source, indicator)` をキーとして upsert される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatRecord {
    /// 指標がURL形式の場合の完全なURL
    pub url: Option<String>,
    /// URLから抽出したホスト名、または指標そのもの（ドメインの場合）
    pub domain: Option<String>,
    /// ソースが報告した生の値
    pub indicator: String,
    /// 指標の種類
    pub indicator_kind: IndicatorKind,
    /// 脅威の種類（キーワードによる推定）
    pub threat_kind: ThreatKind,
    /// マルウェアファミリー
    pub malware_family: Option<String>,
    /// キャンペーン名
    pub campaign_name: Option<String>,
    /// 信頼度 (0 - 100)
    pub confidence: u8,
    /// 初回検出時刻
    pub first_seen: DateTime<Utc>,
    /// 最終検出時刻
    pub last_seen: Option<DateTime<Utc>>,
    /// タグ（最大 MAX_TAGS 件）
    pub tags: Vec<String>,
    /// 説明文
    pub description: String,
    /// プロバイダー名
    pub source: String,
    /// 監査用の元データ断片
    pub raw_data: serde_json::Value,
}

/// 指標の種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    /// URL
    Url,
    /// ドメイン名
    Domain,
    /// IPアドレス
    Ip,
    /// ファイルハッシュ
    Hash,
}

/// 脅威の種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    /// フィッシング
    Phishing,
    /// マルウェア
    Malware,
    /// C&C (Command and Control) サーバー
    CommandAndControl,
    /// スパム送信元
    Spam,
    /// 不明
    #[default]
    Unknown,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Url => "url",
            IndicatorKind::Domain => "domain",
            IndicatorKind::Ip => "ip",
            IndicatorKind::Hash => "hash",
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::Phishing => "phishing",
            ThreatKind::Malware => "malware",
            ThreatKind::CommandAndControl => "command-and-control",
            ThreatKind::Spam => "spam",
            ThreatKind::Unknown => "unknown",
        }
    }

    /// 説明文用の表示名
    pub fn display_name(&self) -> &'static str {
        match self {
            ThreatKind::Phishing => "Phishing",
            ThreatKind::Malware => "Malware",
            ThreatKind::CommandAndControl => "Command-and-control",
            ThreatKind::Spam => "Spam",
            ThreatKind::Unknown => "Suspicious",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ThreatRecord {
    /// 新しい脅威レコードを作成（first_seen は取り込み時刻）
    pub fn new(
        source: impl Into<String>,
        indicator: impl Into<String>,
        indicator_kind: IndicatorKind,
        threat_kind: ThreatKind,
    ) -> Self {
        Self {
            url: None,
            domain: None,
            indicator: indicator.into(),
            indicator_kind,
            threat_kind,
            malware_family: None,
            campaign_name: None,
            confidence: 0,
            first_seen: Utc::now(),
            last_seen: None,
            tags: Vec::new(),
            description: String::new(),
            source: source.into(),
            raw_data: serde_json::Value::Null,
        }
    }

    /// URL形式の指標からレコードを作成
    ///
    /// ホスト名が取り出せないURLは `None` を返す。中途半端なレコードは作らない。
    pub fn from_url(
        source: impl Into<String>,
        url: &str,
        threat_kind: ThreatKind,
    ) -> Option<Self> {
        let url = url.trim();
        let domain = super::transport::extract_domain(url);
        if domain.is_empty() {
            return None;
        }

        let mut record = Self::new(source, url, IndicatorKind::Url, threat_kind);
        record.url = Some(url.to_string());
        record.domain = Some(domain);
        Some(record)
    }

    /// ドメイン形式の指標からレコードを作成
    pub fn from_domain(source: impl Into<String>, domain: &str, threat_kind: ThreatKind) -> Self {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let mut record = Self::new(source, domain.clone(), IndicatorKind::Domain, threat_kind);
        record.domain = Some(domain);
        record
    }

    /// 信頼度を設定（0 - 100 に丸める）
    pub fn with_confidence(mut self, confidence: i64) -> Self {
        self.confidence = confidence.clamp(0, 100) as u8;
        self
    }

    /// タグを設定（空・重複を除き MAX_TAGS 件まで）
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut normalized: Vec<String> = Vec::with_capacity(MAX_TAGS);
        for tag in tags {
            let tag = tag.into().trim().to_string();
            if tag.is_empty() || normalized.contains(&tag) {
                continue;
            }
            normalized.push(tag);
            if normalized.len() == MAX_TAGS {
                break;
            }
        }
        self.tags = normalized;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_first_seen(mut self, first_seen: DateTime<Utc>) -> Self {
        self.first_seen = first_seen;
        self
    }

    pub fn with_last_seen(mut self, last_seen: Option<DateTime<Utc>>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_malware_family(mut self, family: Option<String>) -> Self {
        self.malware_family = family.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn with_campaign_name(mut self, campaign: Option<String>) -> Self {
        self.campaign_name = campaign.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_raw_data(mut self, raw_data: serde_json::Value) -> Self {
        self.raw_data = raw_data;
        self
    }

    /// 永続化可能なレコードかどうかを確認
    pub fn is_valid(&self) -> bool {
        if self.indicator.trim().is_empty() || self.source.trim().is_empty() {
            return false;
        }
        if self.confidence > 100 {
            return false;
        }
        match &self.url {
            Some(_) => self.domain.as_deref().is_some_and(|d| !d.is_empty()),
            None => true,
        }
    }

    /// 重複排除・upsert 用のキー
    pub fn key(&self) -> (String, String) {
        (self.source.clone(), self.indicator.clone())
    }
}

/// フィードに現れる時刻表記をUTCとして解釈
///
/// RFC 3339、`YYYY-MM-DDTHH:MM:SS[.fff]`、`YYYY-MM-DD HH:MM:SS` を受け付ける。
pub fn parse_feed_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// 脅威インテリジェンスエラー
#[derive(Debug, thiserror::Error)]
pub enum ThreatError {
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThreatError {
    /// リトライで回復しうるエラーかどうか
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ThreatError::NetworkError(_) | ThreatError::HttpStatus { .. } | ThreatError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_confidence_is_clamped() {
        let high = ThreatRecord::new("s", "1.2.3.4", IndicatorKind::Ip, ThreatKind::Malware)
            .with_confidence(250);
        assert_eq!(high.confidence, 100);

        let low = ThreatRecord::new("s", "1.2.3.4", IndicatorKind::Ip, ThreatKind::Malware)
            .with_confidence(-20);
        assert_eq!(low.confidence, 0);
    }

    #[test]
    fn test_tags_are_bounded_and_deduplicated() {
        let record = ThreatRecord::new("s", "x.example", IndicatorKind::Domain, ThreatKind::Spam)
            .with_tags(["a", "b", "a", "", "c", "d", "e", "f"]);
        assert_eq!(record.tags, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_from_url_populates_domain() {
        let record =
            ThreatRecord::from_url("OpenPhish", "https://Login.Example.com/x", ThreatKind::Phishing)
                .unwrap();
        assert_eq!(record.domain.as_deref(), Some("login.example.com"));
        assert_eq!(record.url.as_deref(), Some("https://Login.Example.com/x"));
        assert!(record.is_valid());
    }

    #[test]
    fn test_from_url_rejects_unparseable() {
        assert!(ThreatRecord::from_url("OpenPhish", "not a url", ThreatKind::Phishing).is_none());
        assert!(ThreatRecord::from_url("OpenPhish", "", ThreatKind::Phishing).is_none());
    }

    #[test]
    fn test_invalid_records() {
        let no_source = ThreatRecord::new("", "evil.example", IndicatorKind::Domain, ThreatKind::Spam);
        assert!(!no_source.is_valid());

        let no_indicator = ThreatRecord::new("src", "  ", IndicatorKind::Domain, ThreatKind::Spam);
        assert!(!no_indicator.is_valid());
    }

    #[test]
    fn test_serialized_field_names() {
        let record = ThreatRecord::from_domain("src", "Evil.Example.", ThreatKind::CommandAndControl);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["indicatorKind"], "domain");
        assert_eq!(json["threatKind"], "command-and-control");
        assert_eq!(json["domain"], "evil.example");
        assert!(json.get("firstSeen").is_some());
    }

    #[test]
    fn test_parse_feed_timestamp_formats() {
        let csv = parse_feed_timestamp("2024-03-01 12:30:45").unwrap();
        assert_eq!((csv.year(), csv.month(), csv.day()), (2024, 3, 1));
        assert_eq!(csv.hour(), 12);

        let otx = parse_feed_timestamp("2024-03-01T08:00:00.123000").unwrap();
        assert_eq!(otx.hour(), 8);

        let rfc = parse_feed_timestamp("2024-03-01T08:00:00+02:00").unwrap();
        assert_eq!(rfc.hour(), 6);

        assert!(parse_feed_timestamp("").is_none());
        assert!(parse_feed_timestamp("yesterday").is_none());
    }
}
