//! Layered configuration: built-in defaults, then a TOML file, then environment.

mod loader;
mod types;

pub use loader::{ConfigLoader, ENV_PREFIX};
pub use types::{ClassifierConfig, HttpConfig, IngestConfig};
