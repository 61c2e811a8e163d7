//! Client identifier generation
//!
//! Every connect attempt gets a fresh MQTT client id so a stale session on the
//! broker never collides with a new one.

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::config::MqttConfig;

/// Produces the client id for the next connect attempt
pub trait ClientIdGenerator: Send {
    fn generate(&mut self) -> String;
}

/// `<prefix><N random alphanumerics>`
#[derive(Clone, Debug)]
pub struct RandomClientId {
    prefix: String,
    length: usize,
}

impl RandomClientId {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            length,
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(config.client_id_prefix.clone(), config.client_id_length)
    }
}

impl ClientIdGenerator for RandomClientId {
    fn generate(&mut self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

/// Always hands out the same id
#[derive(Clone, Debug)]
pub struct FixedClientId(pub String);

impl ClientIdGenerator for FixedClientId {
    fn generate(&mut self) -> String {
        self.0.clone()
    }
}

impl<F> ClientIdGenerator for F
where
    F: FnMut() -> String + Send,
{
    fn generate(&mut self) -> String {
        self()
    }
}
