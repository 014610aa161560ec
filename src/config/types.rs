use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::threat_intelligence::transport::RetryPolicy;
use crate::threat_intelligence::scheduler::MAX_INTERVAL_HOURS;
use crate::threat_intelligence::{IngestionConfig, ProvidersConfig, RuleBook, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Timer settings
    pub scheduler: SchedulerConfig,

    /// Fan-out settings for a single cycle
    pub ingestion: IngestionConfig,

    /// Shared HTTP transport
    pub http: HttpConfig,

    /// Per-feed settings
    pub providers: ProvidersConfig,

    /// Keyword rule tables
    pub classifier: ClassifierConfig,

    /// Logging configuration
    pub logging: LogConfig,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Attempts per fetch, including the first
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds, doubled on each retry
    pub base_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

/// Classifier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Optional TOML rule file replacing the built-in tables
    pub rules_path: Option<PathBuf>,
}

impl ClassifierConfig {
    pub fn load_rules(&self) -> Result<RuleBook> {
        match &self.rules_path {
            Some(path) => RuleBook::from_toml_file(path),
            None => Ok(RuleBook::default()),
        }
    }
}

impl IngestConfig {
    /// Reject values that would stall or disable the engine silently
    pub fn validate(&self) -> Result<()> {
        fn require(ok: bool, message: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidConfiguration(message.to_string()))
            }
        }

        require(self.scheduler.interval_hours > 0, "scheduler.interval_hours must be > 0")?;
        require(
            self.scheduler.interval_hours <= MAX_INTERVAL_HOURS,
            "scheduler.interval_hours must be <= 8760",
        )?;
        require(self.http.request_timeout_secs > 0, "http.request_timeout_secs must be > 0")?;
        require(self.http.max_attempts > 0, "http.max_attempts must be > 0")?;
        require(
            self.ingestion.provider_timeout_secs > 0,
            "ingestion.provider_timeout_secs must be > 0",
        )?;
        require(
            self.ingestion.max_concurrent_providers > 0,
            "ingestion.max_concurrent_providers must be > 0",
        )?;

        let providers = &self.providers;
        if providers.openphish.enabled {
            require(providers.openphish.max_entries > 0, "providers.openphish.max_entries must be > 0")?;
            require(providers.openphish.confidence <= 100, "providers.openphish.confidence must be <= 100")?;
        }
        if providers.urlhaus.enabled {
            require(providers.urlhaus.max_records > 0, "providers.urlhaus.max_records must be > 0")?;
            require(providers.urlhaus.confidence <= 100, "providers.urlhaus.confidence must be <= 100")?;
        }
        if providers.otx.enabled {
            require(providers.otx.max_pulses > 0, "providers.otx.max_pulses must be > 0")?;
            require(
                providers.otx.max_indicators_per_pulse > 0,
                "providers.otx.max_indicators_per_pulse must be > 0",
            )?;
        }
        if providers.phishing_database.enabled {
            require(
                providers.phishing_database.files.iter().all(|f| f.max_lines > 0),
                "providers.phishing_database.files[].max_lines must be > 0",
            )?;
        }

        Ok(())
    }
}
