use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_DEVICE_ID: &str = "620167361";
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "IOT_F_";
pub const DEFAULT_CLIENT_ID_LENGTH: usize = 12;

/// Whether registry topics are replayed on the very first connect of a session
///
/// The registry is always replayed after a transport-level reconnect. On an
/// initial connect the two policies differ when the registry is already
/// populated, e.g. with seed topics from the configuration file.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Replay only when the transport reports a reconnect. Registry topics
    /// present at an initial connect are left alone and a warning lists them.
    #[default]
    ReconnectOnly,
    /// Replay the registry on every successful connect.
    EveryConnect,
}

/// Broker and session settings for the MQTT core
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Identifier the two well-known topics are derived from
    pub device_id: String,
    pub client_id_prefix: String,
    pub client_id_length: usize,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    /// Pause between automatic reconnect attempts
    pub reconnect_delay_ms: u64,
    pub replay_policy: ReplayPolicy,
    /// Topics placed in the registry as pending before the first connect
    pub seed_topics: Vec<String>,
    /// Capacity of the coordinator's event channel
    pub event_buffer: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            client_id_prefix: DEFAULT_CLIENT_ID_PREFIX.to_string(),
            client_id_length: DEFAULT_CLIENT_ID_LENGTH,
            connect_timeout_secs: 5,
            keep_alive_secs: 5,
            reconnect_delay_ms: 2000,
            replay_policy: ReplayPolicy::default(),
            seed_topics: Vec::new(),
            event_buffer: 256,
        }
    }
}

impl MqttConfig {
    /// Topic the device publishes its updates on (`<id>_pub`)
    pub fn update_topic(&self) -> String {
        format!("{}_pub", self.device_id)
    }

    /// Topic the device listens on for commands (`<id>_sub`)
    pub fn command_topic(&self) -> String {
        format!("{}_sub", self.device_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_derived_from_device_id() {
        let config = MqttConfig {
            device_id: "lab42".to_string(),
            ..Default::default()
        };
        assert_eq!(config.update_topic(), "lab42_pub");
        assert_eq!(config.command_topic(), "lab42_sub");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: MqttConfig = toml::from_str(
            r#"
            host = "broker.local"
            replay_policy = "every_connect"
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.replay_policy, ReplayPolicy::EveryConnect);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.seed_topics.is_empty());
    }
}
