//! Feed Transport
//!
//! 全プロバイダー共通のHTTP取得ユーティリティ（タイムアウト・指数バックオフ・ドメイン抽出）

use crate::threat_intelligence::types::ThreatError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::{Host, Url};

/// フィード取得時に送信する固定 User-Agent
pub const USER_AGENT: &str = concat!(
    "threat-ingest/",
    env!("CARGO_PKG_VERSION"),
    " (+security-awareness feed collector)"
);

/// デフォルトの最大試行回数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// URLからホスト名を抽出
///
/// 不正な入力やホストを持たないURLには空文字列を返す。
/// IPv6アドレスは角括弧なしで返す。
pub fn extract_domain(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return String::new();
    };

    match parsed.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => String::new(),
    }
}

/// 操作をタイムアウト付きで実行
///
/// タイムアウト時は future を破棄するため、実行中のHTTPリクエストも中断される。
pub async fn with_timeout<F, T>(operation: F, timeout: Duration) -> Result<T, ThreatError>
where
    F: Future<Output = Result<T, ThreatError>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(ThreatError::Timeout(timeout)),
    }
}

/// リトライ方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
    /// バックオフの基準遅延
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `attempt` 回目（0始まり）の失敗後に待つ時間: base × 2^attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// フィード取得用HTTPクライアント
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl FeedClient {
    /// 新しいクライアントを作成
    pub fn new(request_timeout: Duration, retry: RetryPolicy) -> Result<Self, ThreatError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ThreatError::ConfigurationError(e.to_string()))?;

        Ok(Self { client, retry })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// GETリクエストをリトライ付きで実行
    pub async fn fetch_with_retry(&self, url: &str) -> Result<reqwest::Response, ThreatError> {
        self.fetch_with_retry_headers(url, &[]).await
    }

    /// 追加ヘッダー付きでGETリクエストをリトライ付きで実行
    ///
    /// ネットワークエラーと非2xxはどちらもリトライ対象。最終試行の非2xxはエラーとして返す。
    pub async fn fetch_with_retry_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, ThreatError> {
        let headers = build_headers(headers)?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.send_once(url, headers.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let remaining = max_attempts - attempt - 1;
                    if remaining == 0 {
                        last_error = Some(e);
                        break;
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt = attempt + 1,
                        remaining,
                        delay_ms = delay.as_millis() as u64,
                        "Feed request failed, retrying: {}",
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ThreatError::NetworkError(format!("no attempt was made for {}", url))
        }))
    }

    /// 本文をテキストとして取得
    pub async fn fetch_text(&self, url: &str) -> Result<String, ThreatError> {
        let response = self.fetch_with_retry(url).await?;
        response
            .text()
            .await
            .map_err(|e| ThreatError::NetworkError(e.to_string()))
    }

    async fn send_once(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, ThreatError> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ThreatError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(url, status = status.as_u16(), "Feed request succeeded");
            Ok(response)
        } else {
            Err(ThreatError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

fn build_headers(headers: &[(&str, &str)]) -> Result<HeaderMap, ThreatError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ThreatError::ConfigurationError(format!("header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ThreatError::ConfigurationError(format!("header {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}
