use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "threat-ingest";
const LOG_FILE_NAME: &str = "threat-ingest.log";

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error) または EnvFilter 形式
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// ログ保持ポリシー
    pub retention: LogRetention,
    /// コンソール出力有効（stderr）
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// JSON形式で出力
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRetention {
    /// アプリケーションは削除しない（logrotate 等に任せる）
    External,
    /// 指定日数後に自動削除
    Days(u32),
    /// 最大ファイル数を保持
    Count(u32),
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            retention: LogRetention::External,
            console_enabled: true,
            file_enabled: false,
            json: false,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_retention(mut self, retention: LogRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    Ok(())
}

/// ログシステムを初期化
///
/// ファイル出力が有効な場合は non-blocking writer のガードを返す。
/// ガードを破棄するとバッファ済みのログが書き出されなくなるため、呼び出し側で保持すること。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guard = None;

    if config.console_enabled {
        let console = fmt::layer().with_writer(std::io::stderr).with_target(true);
        layers.push(if config.json {
            console.json().boxed()
        } else {
            console.boxed()
        });
    }

    if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;

        let file_appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
        };
        let (writer, worker_guard) = non_blocking(file_appender);
        guard = Some(worker_guard);

        let file = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        layers.push(if config.json {
            file.json().boxed()
        } else {
            file.boxed()
        });
    }

    if layers.is_empty() {
        // 最低限の警告出力
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        console = config.console_enabled,
        file = config.file_enabled,
        log_dir = %config.log_dir.display(),
        "Logging initialized"
    );

    if config.file_enabled {
        if let Err(e) = apply_retention_policy(config) {
            tracing::warn!("Failed to apply log retention policy: {}", e);
        }
    }

    Ok(guard)
}

/// ログ保持ポリシーを適用
fn apply_retention_policy(config: &LogConfig) -> Result<usize> {
    match config.retention {
        LogRetention::External => Ok(0),
        LogRetention::Days(days) => cleanup_old_logs_by_age(&config.log_dir, days),
        LogRetention::Count(max_count) => cleanup_old_logs_by_count(&config.log_dir, max_count),
    }
}

/// 更新日時付きのログファイル一覧（新しい順）
fn list_log_files(log_dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>> {
    let mut log_files = Vec::new();

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if is_log_file(&path) {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                log_files.push((path, modified));
            }
        }
    }

    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(log_files)
}

fn remove_log_files<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> usize {
    let mut removed_count = 0;
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove log file {}: {}", path.display(), e);
        } else {
            removed_count += 1;
            tracing::debug!("Removed old log file {}", path.display());
        }
    }
    removed_count
}

/// 日数ベースでログファイルを削除
fn cleanup_old_logs_by_age(log_dir: &Path, max_days: u32) -> Result<usize> {
    let cutoff_time = SystemTime::now() - Duration::from_secs(u64::from(max_days) * 24 * 60 * 60);
    let log_files = list_log_files(log_dir)?;

    let removed_count = remove_log_files(
        log_files
            .iter()
            .filter(|(_, modified)| *modified < cutoff_time)
            .map(|(path, _)| path),
    );

    if removed_count > 0 {
        tracing::info!("Removed {} log files older than {} days", removed_count, max_days);
    }
    Ok(removed_count)
}

/// ファイル数ベースでログファイルを削除
fn cleanup_old_logs_by_count(log_dir: &Path, max_count: u32) -> Result<usize> {
    let log_files = list_log_files(log_dir)?;

    let removed_count =
        remove_log_files(log_files.iter().skip(max_count as usize).map(|(path, _)| path));

    if removed_count > 0 {
        tracing::info!("Removed {} log files (keeping {})", removed_count, max_count);
    }
    Ok(removed_count)
}

/// ログファイルかどうかを判定
fn is_log_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.contains(".log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert_eq!(config.retention, LogRetention::External);
    }

    #[test]
    fn test_log_config_from_toml() {
        let config: LogConfig = toml::from_str(
            r#"
            level = "debug"
            rotation = "hourly"
            retention = { days = 14 }
            file_enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.level, "debug");
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert_eq!(config.retention, LogRetention::Days(14));
        assert!(config.file_enabled);
        assert!(config.console_enabled);
    }

    #[test]
    fn test_ensure_log_dir() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("test_logs");

        assert!(ensure_log_dir(&log_dir).is_ok());
        assert!(log_dir.exists());
    }

    #[test]
    fn test_cleanup_by_count_keeps_newest() {
        let temp_dir = tempdir().unwrap();
        for day in 1..=4 {
            fs::write(temp_dir.path().join(format!("threat-ingest.log.2024-05-0{}", day)), "x").unwrap();
        }
        fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        let removed = cleanup_old_logs_by_count(temp_dir.path(), 2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(list_log_files(temp_dir.path()).unwrap().len(), 2);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_cleanup_by_age_keeps_recent() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("threat-ingest.log"), "x").unwrap();

        assert_eq!(cleanup_old_logs_by_age(temp_dir.path(), 7).unwrap(), 0);
        assert!(temp_dir.path().join("threat-ingest.log").exists());
    }

    #[test]
    fn test_retention_policy_follows_builder_settings() {
        let temp_dir = tempdir().unwrap();
        for hour in 10..=13 {
            fs::write(temp_dir.path().join(format!("threat-ingest.log.2024-05-01-{}", hour)), "x").unwrap();
        }

        let config = LogConfig::default()
            .with_level("debug")
            .with_log_dir(temp_dir.path())
            .with_file(true)
            .with_retention(LogRetention::Count(3));
        assert_eq!(config.level, "debug");
        assert_eq!(apply_retention_policy(&config).unwrap(), 1);

        let external = config.with_retention(LogRetention::External);
        assert_eq!(apply_retention_policy(&external).unwrap(), 0);
        assert_eq!(list_log_files(temp_dir.path()).unwrap().len(), 3);
    }
}
