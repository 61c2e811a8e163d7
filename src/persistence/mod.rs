//! # Persistence Module
//!
//! Only the broker endpoint (host and port) outlives the process. Everything
//! else, including subscriptions, starts fresh on each run.
//!
//! Missing or unreadable files degrade to defaults instead of blocking
//! startup.

pub mod connection_store;

use crate::mqtt::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub use connection_store::ConnectionStore;

pub const APP_DIR: &str = "telelink";

/// Broker endpoint remembered between runs
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PersistedConnection {
    pub host: String,
    pub port: u16,
}

impl PersistedConnection {
    /// Overrides the endpoint of `config` with the remembered one
    pub fn apply_to(&self, config: &mut MqttConfig) {
        config.host = self.host.clone();
        config.port = self.port;
    }
}

/// Per-user directory for configuration and saved state
pub fn app_dir() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(APP_DIR);
    path
}
