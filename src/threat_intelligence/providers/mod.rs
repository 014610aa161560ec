//! Threat Feed Providers
//!
//! 外部脅威フィードとの統合を抽象化。各プロバイダーは1つのフィード形式だけを扱い、
//! 正規化済みの `ThreatRecord` のリストを返す。

pub mod openphish;
pub mod otx;
pub mod phishing_database;
pub mod urlhaus;

pub use openphish::{OpenPhishConfig, OpenPhishProvider};
pub use otx::{OtxConfig, OtxProvider};
pub use phishing_database::{
    CorpusFileConfig, CorpusStatus, PhishingDatabaseConfig, PhishingDatabaseProvider,
};
pub use urlhaus::{UrlhausConfig, UrlhausProvider};

use crate::threat_intelligence::classifier::RuleBook;
use crate::threat_intelligence::transport::FeedClient;
use crate::threat_intelligence::types::{ThreatError, ThreatRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// 脅威フィードプロバイダーの共通インターフェース
#[async_trait]
pub trait ThreatFeedProvider: Send + Sync {
    /// プロバイダー名（レコードの `source` として使われる安定した識別子）
    fn name(&self) -> &str;

    /// フィードを取得して正規化する
    async fn fetch(&self) -> Result<Vec<ThreatRecord>, ThreatError>;

    /// 失敗しない取得
    ///
    /// 内部エラーはログに記録して空リストに変換する。1つのプロバイダーの障害で
    /// 取り込みサイクル全体が止まってはならない。
    async fn fetch_threats(&self) -> Vec<ThreatRecord> {
        match self.fetch().await {
            Ok(records) => records,
            Err(e) => {
                error!(provider = self.name(), "Failed to fetch threats: {}", e);
                Vec::new()
            }
        }
    }
}

/// 全プロバイダーの設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openphish: OpenPhishConfig,
    pub urlhaus: UrlhausConfig,
    pub otx: OtxConfig,
    pub phishing_database: PhishingDatabaseConfig,
}

/// 設定からプロバイダーを生成するファクトリー
pub struct ProviderFactory;

impl ProviderFactory {
    /// 有効化されているプロバイダーを全て生成
    pub fn create_enabled(
        config: &ProvidersConfig,
        client: Arc<FeedClient>,
        rules: Arc<RuleBook>,
    ) -> Result<Vec<Arc<dyn ThreatFeedProvider>>, ThreatError> {
        let mut providers: Vec<Arc<dyn ThreatFeedProvider>> = Vec::new();

        if config.openphish.enabled {
            providers.push(Arc::new(OpenPhishProvider::new(
                config.openphish.clone(),
                client.clone(),
                rules.clone(),
            )?));
        }

        if config.urlhaus.enabled {
            providers.push(Arc::new(UrlhausProvider::new(
                config.urlhaus.clone(),
                client.clone(),
                rules.clone(),
            )?));
        }

        if config.otx.enabled {
            providers.push(Arc::new(OtxProvider::new(
                config.otx.clone(),
                client.clone(),
                rules.clone(),
            )?));
        }

        if config.phishing_database.enabled {
            providers.push(Arc::new(PhishingDatabaseProvider::new(
                config.phishing_database.clone(),
                rules,
            )?));
        }

        info!(
            providers = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "Created {} threat feed providers",
            providers.len()
        );

        Ok(providers)
    }
}

/// コメント行・空行を除いた行を返す
pub(crate) fn content_lines(body: &str) -> impl Iterator<Item = &str> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}
