//! Wiring from [`IngestConfig`] to a ready-to-run scheduler.

use crate::config::IngestConfig;
use crate::error::Result;
use crate::threat_intelligence::{
    FeedClient, IngestionEvents, IngestionScheduler, IngestionService, ProviderFactory, ThreatStore,
};
use std::sync::Arc;
use tracing::info;

/// 構成済みのサービス一式
pub struct Engine {
    pub service: Arc<IngestionService>,
    pub scheduler: Arc<IngestionScheduler>,
    pub events: IngestionEvents,
}

impl Engine {
    pub fn from_config(config: &IngestConfig, store: Arc<dyn ThreatStore>) -> Result<Self> {
        let rules = Arc::new(config.classifier.load_rules()?);
        let client = Arc::new(FeedClient::new(
            config.http.request_timeout(),
            config.http.retry_policy(),
        )?);

        let providers = ProviderFactory::create_enabled(&config.providers, client, rules)?;
        let service = Arc::new(
            IngestionService::new(&config.ingestion)
                .with_store(store)
                .with_providers(providers),
        );

        let events = IngestionEvents::new(config.scheduler.event_buffer_size);
        let scheduler = Arc::new(IngestionScheduler::new(Arc::clone(&service), events.clone()));

        info!(providers = ?service.provider_names(), "Ingestion engine ready");

        Ok(Self {
            service,
            scheduler,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threat_intelligence::InMemoryThreatStore;

    #[tokio::test]
    async fn test_from_default_config() {
        let mut config = IngestConfig::default();
        config.providers.otx.enabled = false;

        let engine = Engine::from_config(&config, Arc::new(InMemoryThreatStore::new())).unwrap();
        assert_eq!(
            engine.service.provider_names(),
            vec!["OpenPhish", "URLhaus", "Phishing.Database"]
        );
        assert!(!engine.scheduler.is_running().await);
    }
}
