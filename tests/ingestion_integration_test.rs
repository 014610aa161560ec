//! Ingestion Cycle Integration Tests
//!
//! 設定から組み立てたエンジン全体をモックフィードとローカルコーパスで実行する

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use threat_ingest::config::IngestConfig;
use threat_ingest::threat_intelligence::*;
use threat_ingest::Engine;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const URLHAUS_CSV: &str = "\
# abuse.ch URLhaus Database Dump (CSV - recent URLs)
# id,dateadded,url,url_status,last_online,threat,tags,urlhaus_link,reporter
\"1\",\"2024-05-01 09:00:00\",\"http://203.0.113.10/bins/mozi.m\",\"online\",\"2024-05-01 09:00:00\",\"malware_download\",\"elf,Mozi\",\"https://urlhaus.abuse.ch/url/1/\",\"r\"
\"2\",\"2024-05-01 09:00:00\",\"http://203.0.113.11/x\",\"offline\",\"\",\"malware_download\",\"\",\"https://urlhaus.abuse.ch/url/2/\",\"r\"
";

async fn mock_feeds() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/openphish/feed.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "https://paypal-login.example.com/\nhttps://paypal-login.example.com/\nhttps://dhl-track.example.net/parcel\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/urlhaus/csv_recent/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(URLHAUS_CSV))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pulses/activity"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    server
}

fn create_corpus() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("phishing-domains-INACTIVE.txt"),
        "# inactive\nold-bank.example\nshared.example\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("phishing-domains-ACTIVE.txt"),
        "shared.example\n",
    )
    .unwrap();
    dir
}

fn create_test_config(server: &MockServer, corpus: &TempDir) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.http.base_delay_ms = 5;
    config.http.max_attempts = 2;
    config.ingestion.provider_timeout_secs = 10;

    config.providers.openphish.feed_url = format!("{}/openphish/feed.txt", server.uri());
    config.providers.urlhaus.feed_url = format!("{}/urlhaus/csv_recent/", server.uri());
    config.providers.otx.base_url = server.uri();
    config.providers.otx.api_key = None;
    config.providers.phishing_database.directory = corpus.path().to_path_buf();
    config
}

#[tokio::test]
async fn test_full_cycle_with_partial_failure() {
    let server = mock_feeds().await;
    let corpus = create_corpus();
    let config = create_test_config(&server, &corpus);

    let store = Arc::new(InMemoryThreatStore::new());
    let engine = Engine::from_config(&config, store.clone()).unwrap();

    let summary = engine.service.ingest_all_feeds().await;

    assert_eq!(summary.provider("OpenPhish").unwrap().count, 3);
    assert_eq!(summary.provider("URLhaus").unwrap().count, 1);
    assert_eq!(summary.provider("Phishing.Database").unwrap().count, 3);

    let otx = summary.provider("AlienVault OTX").unwrap();
    assert!(!otx.ok);
    assert_eq!(otx.count, 0);
    assert_eq!(summary.failed_providers(), vec!["AlienVault OTX".to_string()]);

    // 同一URLの重複とコーパス内の重複がそれぞれ1件ずつ除かれる
    assert_eq!(summary.duplicates_dropped, 2);
    assert_eq!(summary.total_ingested, 5);
    assert_eq!(store.len().await, 5);

    // 上位ティアのファイルが後に処理されるため active が残る
    let shared = store.get("Phishing.Database", "shared.example").await.unwrap();
    assert_eq!(shared.confidence, 85);
    assert!(shared.tags.contains(&"active".to_string()));

    let mozi = store.get("URLhaus", "http://203.0.113.10/bins/mozi.m").await.unwrap();
    assert_eq!(mozi.malware_family.as_deref(), Some("Mozi"));
}

#[tokio::test]
async fn test_repeated_cycles_update_existing_records() {
    let server = mock_feeds().await;
    let corpus = create_corpus();
    let config = create_test_config(&server, &corpus);

    let store = Arc::new(InMemoryThreatStore::new());
    let engine = Engine::from_config(&config, store.clone()).unwrap();

    let first = engine.scheduler.run_ingestion().await.unwrap();
    let second = engine.scheduler.run_ingestion().await.unwrap();

    assert_ne!(first.cycle_id, second.cycle_id);
    assert_eq!(first.persisted.unwrap().inserted, 5);
    assert_eq!(second.persisted.unwrap().inserted, 0);
    assert_eq!(second.persisted.unwrap().updated, 5);
    assert_eq!(store.len().await, 5);
    assert_eq!(engine.scheduler.status().await.cycles_completed, 2);
}

#[tokio::test]
async fn test_scheduler_publishes_cycle_results() {
    let server = mock_feeds().await;
    let corpus = create_corpus();
    let config = create_test_config(&server, &corpus);

    let engine = Engine::from_config(&config, Arc::new(InMemoryThreatStore::new())).unwrap();
    let mut events = engine.events.subscribe();

    engine.scheduler.start_every_hours(6).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let event = events.recv().await.unwrap();
            if let IngestionEventKind::CycleCompleted {
                total_ingested,
                failed_providers,
                ..
            } = event.kind
            {
                return (total_ingested, failed_providers);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(completed.0, 5);
    assert_eq!(completed.1, vec!["AlienVault OTX".to_string()]);

    let status = engine.scheduler.status().await;
    assert!(status.running);
    assert_eq!(status.interval_secs, Some(6 * 3600));

    engine.scheduler.stop().await;
    assert!(!engine.scheduler.status().await.running);
}

#[tokio::test]
async fn test_all_feeds_down_still_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let empty_corpus = tempfile::tempdir().unwrap();
    let config = create_test_config(&server, &empty_corpus);
    let engine = Engine::from_config(&config, Arc::new(InMemoryThreatStore::new())).unwrap();

    let summary = engine.service.ingest_all_feeds().await;
    assert_eq!(summary.total_ingested, 0);
    assert_eq!(summary.failed_providers().len(), 3);
    // 空のコーパスディレクトリは失敗ではない
    assert!(summary.provider("Phishing.Database").unwrap().ok);
}
