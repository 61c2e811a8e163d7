//! Session Handle - caller-facing API for the MQTT session
//!
//! Spawns the [`SessionCoordinator`] in a tokio task and hands out a cheap,
//! cloneable handle. Every operation only enqueues a command; results show
//! up later in the status and inbound watch channels.
//!
//! ```text
//! SessionHandle ─[Command]─┐
//!                          ├─► mpsc ─► SessionCoordinator ─► watch<SessionStatus>
//! Transport ─[Transport]───┘                              └─► watch<InboundRecord>
//! ```

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client_id::{ClientIdGenerator, RandomClientId};
use super::config::MqttConfig;
use super::error::SessionError;
use super::message_manager::InboundRecord;
use super::mqtt_handler::{Command, SessionCoordinator, SessionEvent, SessionStatus};
use super::rumqtt::RumqttConnector;
use super::transport::Connector;

#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    inbound: watch::Receiver<InboundRecord>,
    shutdown: CancellationToken,
    config: MqttConfig,
}

impl SessionHandle {
    /// Spawns a session backed by rumqttc with random client ids
    pub fn spawn(config: MqttConfig) -> (Self, JoinHandle<()>) {
        let client_ids = RandomClientId::from_config(&config);
        Self::spawn_with(config, Box::new(RumqttConnector), Box::new(client_ids))
    }

    /// Spawns a session with an explicit transport and id generator
    pub fn spawn_with(
        config: MqttConfig,
        connector: Box<dyn Connector>,
        client_ids: Box<dyn ClientIdGenerator>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.event_buffer.max(1));
        debug!(
            "Created session event channel with capacity {}",
            config.event_buffer
        );

        let coordinator =
            SessionCoordinator::new(config.clone(), connector, client_ids, sender.clone());
        let status = coordinator.subscribe_status();
        let inbound = coordinator.subscribe_inbound();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(coordinator.run(receiver, shutdown.clone()));
        info!("MQTT session spawned for device {}", config.device_id);

        (
            Self {
                commands: sender,
                status,
                inbound,
                shutdown,
                config,
            },
            task,
        )
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), SessionError> {
        self.send(Command::Connect {
            host: host.into(),
            port,
        })
        .await
    }

    /// Connects to the host and port from the configuration
    pub async fn connect_configured(&self) -> Result<(), SessionError> {
        self.connect(self.config.host.clone(), self.config.port).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect).await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Subscribe(topic.into())).await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Unsubscribe(topic.into())).await
    }

    pub async fn unsubscribe_all(&self) -> Result<(), SessionError> {
        self.send(Command::UnsubscribeAll).await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.send(Command::Publish {
            topic: topic.into(),
            body: body.into(),
        })
        .await
    }

    /// Publishes a toggle command for `device` on the command topic
    pub async fn toggle(&self, device: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Toggle(device.into())).await
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn inbound(&self) -> watch::Receiver<InboundRecord> {
        self.inbound.clone()
    }

    /// Stops the coordinator; an open session is closed on the way out
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(SessionEvent::Command(command))
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }
}
