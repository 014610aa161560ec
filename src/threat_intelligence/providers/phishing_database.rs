//! Phishing.Database local corpus
//!
//! 指標の種類 × ライフサイクル状態ごとに1ファイルを持つローカルディレクトリ。
//! 状態ごとに信頼度と見かけ上の経過時間を割り当てる。経過時間は表示用の乱数であり、実測値ではない。

use super::{content_lines, ThreatFeedProvider};
use crate::threat_intelligence::classifier::RuleBook;
use crate::threat_intelligence::types::{IndicatorKind, ThreatError, ThreatKind, ThreatRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "Phishing.Database";
const SOURCE_TAG: &str = "phishing-database";

/// ライフサイクル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusStatus {
    New,
    Active,
    Inactive,
    Invalid,
}

impl CorpusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusStatus::New => "new",
            CorpusStatus::Active => "active",
            CorpusStatus::Inactive => "inactive",
            CorpusStatus::Invalid => "invalid",
        }
    }

    /// 状態ごとの信頼度
    pub fn confidence(&self) -> i64 {
        match self {
            CorpusStatus::New => 95,
            CorpusStatus::Active => 85,
            CorpusStatus::Inactive => 60,
            CorpusStatus::Invalid => 30,
        }
    }

    /// 状態ごとの経過時間の範囲（分）
    pub fn age_range_minutes(&self) -> (i64, i64) {
        const HOUR: i64 = 60;
        const DAY: i64 = 24 * HOUR;
        match self {
            CorpusStatus::New => (0, HOUR),
            CorpusStatus::Active => (HOUR, 7 * DAY),
            CorpusStatus::Inactive => (7 * DAY, 30 * DAY),
            CorpusStatus::Invalid => (30 * DAY, 120 * DAY),
        }
    }

    fn random_age<R: Rng>(&self, rng: &mut R) -> Duration {
        let (min, max) = self.age_range_minutes();
        Duration::minutes(rng.gen_range(min..=max))
    }
}

/// コーパス内の1ファイル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusFileConfig {
    pub file_name: String,
    pub kind: IndicatorKind,
    pub status: CorpusStatus,
    /// ファイルごとの最大行数
    pub max_lines: usize,
}

impl CorpusFileConfig {
    pub fn new(file_name: &str, kind: IndicatorKind, status: CorpusStatus, max_lines: usize) -> Self {
        Self {
            file_name: file_name.to_string(),
            kind,
            status,
            max_lines,
        }
    }
}

/// Phishing.Database プロバイダー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhishingDatabaseConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// 処理順。重複は後のファイルが優先されるため、優先度の低いものから並べる。
    /// 空の場合は Phishing.Database 標準のファイル構成を使う
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<CorpusFileConfig>,
}

impl Default for PhishingDatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("data/phishing-database"),
            files: Vec::new(),
        }
    }
}

impl PhishingDatabaseConfig {
    /// 実際に処理するファイル一覧
    pub fn effective_files(&self) -> Vec<CorpusFileConfig> {
        if self.files.is_empty() {
            default_corpus_files()
        } else {
            self.files.clone()
        }
    }
}

fn default_corpus_files() -> Vec<CorpusFileConfig> {
    use CorpusStatus::*;
    use IndicatorKind::*;

    vec![
        CorpusFileConfig::new("phishing-links-INVALID.txt", Url, Invalid, 500),
        CorpusFileConfig::new("phishing-domains-INVALID.txt", Domain, Invalid, 500),
        CorpusFileConfig::new("phishing-links-INACTIVE.txt", Url, Inactive, 1_000),
        CorpusFileConfig::new("phishing-domains-INACTIVE.txt", Domain, Inactive, 1_000),
        CorpusFileConfig::new("phishing-IPs-ACTIVE.txt", Ip, Active, 2_000),
        CorpusFileConfig::new("phishing-links-ACTIVE.txt", Url, Active, 5_000),
        CorpusFileConfig::new("phishing-domains-ACTIVE.txt", Domain, Active, 5_000),
        CorpusFileConfig::new("phishing-links-NEW-today.txt", Url, New, 50_000),
        CorpusFileConfig::new("phishing-domains-NEW-today.txt", Domain, New, 50_000),
        CorpusFileConfig::new("phishing-links-NEW-last-hour.txt", Url, New, 50_000),
    ]
}

/// Phishing.Database プロバイダー
pub struct PhishingDatabaseProvider {
    directory: PathBuf,
    files: Vec<CorpusFileConfig>,
    rules: Arc<RuleBook>,
}

impl PhishingDatabaseProvider {
    pub fn new(config: PhishingDatabaseConfig, rules: Arc<RuleBook>) -> Result<Self, ThreatError> {
        let files = config.effective_files();
        if let Some(file) = files.iter().find(|f| f.file_name.trim().is_empty() || f.max_lines == 0) {
            return Err(ThreatError::ConfigurationError(format!(
                "invalid Phishing.Database corpus entry: {:?}",
                file
            )));
        }

        Ok(Self {
            directory: config.directory,
            files,
            rules,
        })
    }

    /// 1ファイル分の内容をパース
    pub fn parse_file(
        &self,
        file: &CorpusFileConfig,
        body: &str,
        now: DateTime<Utc>,
    ) -> Vec<ThreatRecord> {
        let mut rng = rand::thread_rng();

        content_lines(body)
            .take(file.max_lines)
            .filter_map(|line| {
                let record = self.line_to_record(file.kind, line);
                if record.is_none() {
                    warn!(
                        provider = PROVIDER_NAME,
                        file = %file.file_name,
                        line,
                        "Skipping malformed entry"
                    );
                }
                record
            })
            .map(|record| {
                let first_seen = now - file.status.random_age(&mut rng);
                let description = self.rules.phishing_description(&record.indicator);
                let line = record.indicator.clone();
                record
                    .with_confidence(file.status.confidence())
                    .with_first_seen(first_seen)
                    .with_tags([SOURCE_TAG, file.status.as_str(), file.kind.as_str()])
                    .with_description(description)
                    .with_raw_data(json!({
                        "file": file.file_name,
                        "status": file.status,
                        "line": line,
                    }))
            })
            .collect()
    }

    fn line_to_record(&self, kind: IndicatorKind, line: &str) -> Option<ThreatRecord> {
        match kind {
            IndicatorKind::Url => ThreatRecord::from_url(PROVIDER_NAME, line, ThreatKind::Phishing),
            IndicatorKind::Domain => {
                if line.contains(char::is_whitespace) || !line.contains('.') || line.contains('/') {
                    return None;
                }
                Some(ThreatRecord::from_domain(PROVIDER_NAME, line, ThreatKind::Phishing))
            }
            IndicatorKind::Ip => line.parse::<IpAddr>().ok().map(|ip| {
                ThreatRecord::new(PROVIDER_NAME, ip.to_string(), IndicatorKind::Ip, ThreatKind::Phishing)
            }),
            IndicatorKind::Hash => None,
        }
    }

    /// ファイルを読み込む。存在しない場合は `None`
    async fn read_file(&self, file: &CorpusFileConfig) -> Option<String> {
        let path = self.directory.join(&file.file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(provider = PROVIDER_NAME, path = %path.display(), "Corpus file not present, skipping");
                None
            }
            Err(e) => {
                warn!(provider = PROVIDER_NAME, path = %path.display(), "Failed to read corpus file: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ThreatFeedProvider for PhishingDatabaseProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(&self) -> Result<Vec<ThreatRecord>, ThreatError> {
        if !self.directory.is_dir() {
            return Err(ThreatError::ConfigurationError(format!(
                "corpus directory {} does not exist",
                self.directory.display()
            )));
        }

        let now = Utc::now();
        let mut records = Vec::new();

        for file in &self.files {
            let Some(body) = self.read_file(file).await else {
                continue;
            };

            let parsed = self.parse_file(file, &body, now);
            debug!(
                provider = PROVIDER_NAME,
                file = %file.file_name,
                count = parsed.len(),
                "Parsed corpus file"
            );
            records.extend(parsed);
        }

        info!(provider = PROVIDER_NAME, count = records.len(), "Ingested threats");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn create_test_provider(directory: PathBuf, files: Vec<CorpusFileConfig>) -> PhishingDatabaseProvider {
        let config = PhishingDatabaseConfig {
            enabled: true,
            directory,
            files,
        };
        PhishingDatabaseProvider::new(config, Arc::new(RuleBook::default())).unwrap()
    }

    #[test]
    fn test_status_tiers() {
        let now = Utc::now();
        let provider = create_test_provider(PathBuf::from("."), default_corpus_files());

        for (status, min_days, max_days) in [
            (CorpusStatus::New, 0, 1),
            (CorpusStatus::Active, 0, 7),
            (CorpusStatus::Inactive, 7, 30),
            (CorpusStatus::Invalid, 30, 120),
        ] {
            let file = CorpusFileConfig::new("f.txt", IndicatorKind::Domain, status, 100);
            let records = provider.parse_file(&file, "a.example\nb.example\nc.example\n", now);
            assert_eq!(records.len(), 3);
            for record in records {
                assert_eq!(i64::from(record.confidence), status.confidence());
                let age = now - record.first_seen;
                assert!(age >= Duration::days(min_days));
                assert!(age <= Duration::days(max_days));
                assert!(record.tags.contains(&status.as_str().to_string()));
            }
        }
    }

    #[test]
    fn test_line_validation_per_kind() {
        let provider = create_test_provider(PathBuf::from("."), default_corpus_files());
        let now = Utc::now();

        let urls = CorpusFileConfig::new("links.txt", IndicatorKind::Url, CorpusStatus::Active, 100);
        let records = provider.parse_file(&urls, "https://paypal.example.com/x\nnot a url\n", now);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description, "Phishing site targeting PayPal");

        let domains = CorpusFileConfig::new("domains.txt", IndicatorKind::Domain, CorpusStatus::Active, 100);
        let records = provider.parse_file(&domains, "Bad.Example\nlocalhost\nwith space.example\n", now);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].indicator, "bad.example");

        let ips = CorpusFileConfig::new("ips.txt", IndicatorKind::Ip, CorpusStatus::Active, 100);
        let records = provider.parse_file(&ips, "198.51.100.4\n999.1.1.1\n2001:db8::1\n", now);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_per_file_line_cap() {
        let provider = create_test_provider(PathBuf::from("."), default_corpus_files());
        let file = CorpusFileConfig::new("d.txt", IndicatorKind::Domain, CorpusStatus::Invalid, 2);
        let body = "# comment\na.example\n\nb.example\nc.example\n";
        assert_eq!(provider.parse_file(&file, body, Utc::now()).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("phishing-domains-ACTIVE.txt"),
            "# Phishing.Database\nlogin-apple.example\nsecure-bank.example\n",
        )
        .unwrap();

        let files = vec![
            CorpusFileConfig::new("phishing-links-NEW-today.txt", IndicatorKind::Url, CorpusStatus::New, 100),
            CorpusFileConfig::new("phishing-domains-ACTIVE.txt", IndicatorKind::Domain, CorpusStatus::Active, 100),
        ];
        let provider = create_test_provider(dir.path().to_path_buf(), files);

        let records = provider.fetch().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source == "Phishing.Database" && r.is_valid()));
    }

    #[tokio::test]
    async fn test_missing_directory_is_fail_soft() {
        let provider = create_test_provider(PathBuf::from("/nonexistent/phishing-db"), default_corpus_files());
        assert!(provider.fetch().await.is_err());
        assert!(provider.fetch_threats().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_yields_nothing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("phishing-links-ACTIVE.txt"), "").unwrap();

        let files = vec![CorpusFileConfig::new(
            "phishing-links-ACTIVE.txt",
            IndicatorKind::Url,
            CorpusStatus::Active,
            100,
        )];
        let provider = create_test_provider(dir.path().to_path_buf(), files);
        assert!(provider.fetch().await.unwrap().is_empty());
    }

    #[test]
    fn test_default_layout_lowest_priority_first() {
        let files = PhishingDatabaseConfig::default().effective_files();
        assert_eq!(files.first().unwrap().status, CorpusStatus::Invalid);
        assert_eq!(files.last().unwrap().status, CorpusStatus::New);
    }

    #[test]
    fn test_zero_line_cap_rejected() {
        let config = PhishingDatabaseConfig {
            files: vec![CorpusFileConfig::new("a.txt", IndicatorKind::Url, CorpusStatus::New, 0)],
            ..Default::default()
        };
        assert!(PhishingDatabaseProvider::new(config, Arc::new(RuleBook::default())).is_err());
    }
}
