//! # threat-ingest
//!
//! Periodic threat-intelligence ingestion engine.
//!
//! Pulls indicators of compromise from public feeds (plaintext URL lists,
//! comment-headed CSV dumps, JSON pulse APIs) and a local phishing corpus,
//! normalizes them into [`ThreatRecord`]s, merges them per cycle and hands the
//! batch to a [`ThreatStore`].

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod threat_intelligence;

pub use engine::Engine;
pub use error::{Error, Result};
pub use threat_intelligence::{
    IngestionScheduler, IngestionService, IngestionSummary, ThreatError, ThreatRecord, ThreatStore,
};
