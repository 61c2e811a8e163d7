//! Transport seam between the session core and an MQTT client library
//!
//! A [`Connector`] opens a connection and returns a [`Transport`] for issuing
//! requests. Everything the library reports back (connect completion, inbound
//! messages, acknowledgements, loss of the connection) travels as a
//! [`TransportEvent`] through the [`EventSink`] handed over at connect time.
//!
//! ```text
//! SessionCoordinator ──connect()──► Connector ──► Transport
//!        ▲                                           │
//!        └──────── SessionEvent::Transport ◄─ EventSink
//! ```

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::TransportError;
use super::mqtt_handler::SessionEvent;

/// Opaque data attached to a subscribe/unsubscribe request and handed back
/// unchanged with its acknowledgement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckContext {
    pub topic: String,
}

impl AckContext {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

/// Everything a transport needs to open one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub use_ssl: bool,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl ConnectOptions {
    pub fn uri(&self) -> String {
        let scheme = if self.use_ssl { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A message ready to be handed to the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Why a connection went away
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LossReason {
    /// We asked for the disconnect; nothing went wrong
    Requested,
    Error(String),
}

/// Outcomes reported asynchronously by a transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection. `reconnect` is true when this
    /// transport had already been connected before.
    ConnectCompleted { reconnect: bool },
    /// A connect attempt failed before the first successful connect
    ConnectFailed {
        host: String,
        port: u16,
        message: String,
    },
    ConnectionLost(LossReason),
    /// Automatic reconnect is trying again after a loss
    Reconnecting,
    MessageArrived { topic: String, payload: Vec<u8> },
    SubscribeAck {
        context: AckContext,
        result: Result<(), String>,
    },
    UnsubscribeAck {
        context: AckContext,
        result: Result<(), String>,
    },
}

/// Requests that can be issued on an open connection
///
/// All calls only queue work and return immediately; outcomes arrive later
/// as [`TransportEvent`]s.
pub trait Transport: Send {
    fn subscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError>;

    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Opens connections
pub trait Connector: Send {
    fn connect(
        &mut self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Delivers transport events into the coordinator's channel, tagged with the
/// generation of the session that produced them
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    sender: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(generation: u64, sender: mpsc::Sender<SessionEvent>) -> Self {
        Self { generation, sender }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.sender
            .send(self.wrap(event))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Non-blocking variant for callers outside an async context
    pub fn try_emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.sender.try_send(self.wrap(event)).map_err(|e| {
            debug!("Dropping transport event: {}", e);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Request("event channel full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn wrap(&self, event: TransportEvent) -> SessionEvent {
        SessionEvent::Transport {
            generation: self.generation,
            event,
        }
    }
}
