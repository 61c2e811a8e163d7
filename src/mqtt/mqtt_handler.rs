//! Session coordinator
//!
//! Owns the session, the topic registry and the latest inbound record, and
//! applies every command and transport event from one ordered channel. Since
//! only this task touches the registry, per-topic updates need no locking.
//!
//! # Connection state machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Disconnected
//!                                  │     ▲
//!                                  ▼     │
//!                       ConnectionLost ──► Reconnecting
//! ```
//!
//! Every (re)entry into `Connected` subscribes to the update topic; a
//! reconnect also replays all registry topics.

use chrono::{DateTime, Local};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client_id::ClientIdGenerator;
use super::config::{MqttConfig, ReplayPolicy};
use super::message_manager::{decode_payload, DeviceCommand, InboundRecord};
use super::registry::{SubscriptionStatus, TopicRegistry};
use super::session::{ActiveSession, Open, Opening, Session};
use super::transport::{
    AckContext, ConnectOptions, Connector, EventSink, LossReason, OutboundMessage, TransportEvent,
};

/// Number of failures kept in [`SessionStatus::failures`]
pub const FAILURE_LOG_CAPACITY: usize = 32;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
    Reconnecting,
}

/// Operations requested by callers of the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect { host: String, port: u16 },
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    UnsubscribeAll,
    Publish { topic: String, body: String },
    Toggle(String),
}

/// Everything the coordinator reacts to, in arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Command(Command),
    Transport { generation: u64, event: TransportEvent },
}

/// A failure recorded by the core instead of being returned to a caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionFailure {
    Connect {
        host: String,
        port: u16,
        message: String,
    },
    ConnectionLost(String),
    Subscribe {
        topic: String,
        message: String,
    },
    Unsubscribe {
        topic: String,
        message: String,
    },
    Publish {
        topic: String,
        message: String,
    },
    Decode {
        topic: String,
        message: String,
    },
    NotConnected(&'static str),
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionFailure::Connect {
                host,
                port,
                message,
            } => write!(f, "Connection to {}:{} failed: {}", host, port, message),
            SessionFailure::ConnectionLost(message) => write!(f, "Connection lost: {}", message),
            SessionFailure::Subscribe { topic, message } => {
                write!(f, "Failed to subscribe to {}: {}", topic, message)
            }
            SessionFailure::Unsubscribe { topic, message } => {
                write!(f, "Failed to unsubscribe from {}: {}", topic, message)
            }
            SessionFailure::Publish { topic, message } => {
                write!(f, "Failed to publish to {}: {}", topic, message)
            }
            SessionFailure::Decode { topic, message } => {
                write!(f, "Undecodable message on {}: {}", topic, message)
            }
            SessionFailure::NotConnected(operation) => {
                write!(f, "No active connection for {}", operation)
            }
        }
    }
}

/// Snapshot of the session, republished whenever a handled event changes it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub client_id: Option<String>,
    pub broker: Option<(String, u16)>,
    pub topics: BTreeMap<String, SubscriptionStatus>,
    pub failures: VecDeque<SessionFailure>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl SessionStatus {
    pub fn last_failure(&self) -> Option<&SessionFailure> {
        self.failures.back()
    }
}

pub struct SessionCoordinator {
    config: MqttConfig,
    connector: Box<dyn Connector>,
    client_ids: Box<dyn ClientIdGenerator>,
    events: mpsc::Sender<SessionEvent>,
    session: Option<ActiveSession>,
    generation: u64,
    state: ConnectionState,
    registry: TopicRegistry,
    failures: VecDeque<SessionFailure>,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
    inbound: watch::Sender<InboundRecord>,
    status: watch::Sender<SessionStatus>,
}

impl SessionCoordinator {
    /// Creates the coordinator. `events` must feed the receiver later passed
    /// to [`SessionCoordinator::run`]; transports get clones of it.
    pub fn new(
        config: MqttConfig,
        connector: Box<dyn Connector>,
        client_ids: Box<dyn ClientIdGenerator>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let registry = TopicRegistry::seeded(config.seed_topics.iter().cloned());
        let (inbound, _) = watch::channel(InboundRecord::initial(&config.device_id));
        let (status, _) = watch::channel(SessionStatus::default());

        let coordinator = Self {
            config,
            connector,
            client_ids,
            events,
            session: None,
            generation: 0,
            state: ConnectionState::Disconnected,
            registry,
            failures: VecDeque::with_capacity(FAILURE_LOG_CAPACITY),
            messages_received: 0,
            messages_sent: 0,
            last_activity: None,
            inbound,
            status,
        };
        coordinator.publish_status();
        coordinator
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn inbound(&self) -> InboundRecord {
        self.inbound.borrow().clone()
    }

    pub fn failures(&self) -> &VecDeque<SessionFailure> {
        &self.failures
    }

    /// Generation of the live session, if there is one
    pub fn active_generation(&self) -> Option<u64> {
        self.session.as_ref().map(ActiveSession::generation)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_inbound(&self) -> watch::Receiver<InboundRecord> {
        self.inbound.subscribe()
    }

    /// Processes events until cancelled, then closes any open session
    pub async fn run(
        mut self,
        mut receiver: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Session coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested for session coordinator");
                    break;
                }
                event = receiver.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("Event channel closed");
                        break;
                    }
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.close();
            self.set_state(ConnectionState::Disconnected);
            self.publish_status();
        }
        info!("Session coordinator stopped");
    }

    /// Applies one event and publishes the resulting status
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.handle_command(command),
            SessionEvent::Transport { generation, event } => {
                if self.active_generation() == Some(generation) {
                    self.handle_transport(event);
                } else {
                    debug!(
                        "Ignoring event from stale session generation {}: {:?}",
                        generation, event
                    );
                }
            }
        }
        self.publish_status();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port } => self.connect(host, port),
            Command::Disconnect => self.disconnect(),
            Command::Subscribe(topic) => self.subscribe(&topic),
            Command::Unsubscribe(topic) => self.unsubscribe(&topic),
            Command::UnsubscribeAll => self.unsubscribe_all(),
            Command::Publish { topic, body } => self.publish(&topic, body),
            Command::Toggle(device) => self.toggle(&device),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectCompleted { reconnect } => self.on_connect_completed(reconnect),
            TransportEvent::ConnectFailed {
                host,
                port,
                message,
            } => self.on_connect_failed(host, port, message),
            TransportEvent::ConnectionLost(reason) => self.on_connection_lost(reason),
            TransportEvent::Reconnecting => {
                debug!("Automatic reconnect in progress");
                self.set_state(ConnectionState::Reconnecting);
            }
            TransportEvent::MessageArrived { topic, payload } => {
                self.on_message_arrived(topic, &payload)
            }
            TransportEvent::SubscribeAck { context, result } => {
                self.on_subscribe_ack(context, result)
            }
            TransportEvent::UnsubscribeAck { context, result } => {
                self.on_unsubscribe_ack(context, result)
            }
        }
    }

    // ---- connection controller ----

    pub fn connect(&mut self, host: String, port: u16) {
        if let Some(previous) = self.session.take() {
            info!("Replacing existing session before connecting");
            previous.close();
        }

        let client_id = self.client_ids.generate();
        self.generation += 1;
        let options = ConnectOptions {
            host: host.clone(),
            port,
            client_id: client_id.clone(),
            connect_timeout: self.config.connect_timeout(),
            keep_alive: self.config.keep_alive(),
            use_ssl: false,
            auto_reconnect: true,
            reconnect_delay: self.config.reconnect_delay(),
        };

        info!(
            "MQTT: Connecting to server {} port {} as {}",
            host, port, client_id
        );
        self.set_state(ConnectionState::Connecting);

        let sink = EventSink::new(self.generation, self.events.clone());
        match self.connector.connect(&options, sink) {
            Ok(transport) => {
                self.session = Some(ActiveSession::Opening(Session::<Opening>::opening(
                    host,
                    port,
                    client_id,
                    self.generation,
                    transport,
                )));
            }
            Err(e) => {
                self.on_connect_failed(host, port, e.to_string());
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    pub fn disconnect(&mut self) {
        match self.session.take() {
            Some(session) => {
                session.close();
                self.set_state(ConnectionState::Disconnected);
            }
            None => {
                warn!("MQTT: Disconnect requested without an active session");
                self.record(SessionFailure::NotConnected("disconnect"));
            }
        }
    }

    fn on_connect_completed(&mut self, reconnect: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let session = session.establish();
        let (host, port) = session.endpoint();
        info!(
            "Connected to: mqtt://{}:{} , Reconnect: {}",
            host, port, reconnect
        );
        self.session = Some(session);
        self.set_state(ConnectionState::Connected);

        for topic in self.topics_to_subscribe(reconnect) {
            self.subscribe(&topic);
        }
    }

    /// Distinct topics to request after a connect: the update topic first,
    /// then registry topics when a replay is due
    fn topics_to_subscribe(&self, reconnect: bool) -> Vec<String> {
        let update_topic = self.config.update_topic();
        let mut seen = BTreeSet::from([update_topic.clone()]);
        let mut topics = vec![update_topic];

        let replay = reconnect || self.config.replay_policy == ReplayPolicy::EveryConnect;
        let registered = self.registry.snapshot();

        if replay {
            for topic in registered {
                if seen.insert(topic.clone()) {
                    topics.push(topic);
                }
            }
        } else {
            let skipped: Vec<&String> = registered.iter().filter(|t| !seen.contains(*t)).collect();
            if !skipped.is_empty() {
                warn!(
                    "Initial connect does not replay {} registry topic(s): {:?}",
                    skipped.len(),
                    skipped
                );
            }
        }
        topics
    }

    fn on_connect_failed(&mut self, host: String, port: u16, message: String) {
        error!(
            "MQTT: Connection to {} failed.\nError message : {}",
            host, message
        );
        self.record(SessionFailure::Connect {
            host,
            port,
            message,
        });
    }

    fn on_connection_lost(&mut self, reason: LossReason) {
        match reason {
            LossReason::Requested => {
                debug!("Connection closed on request");
            }
            LossReason::Error(message) => {
                warn!("MQTT: Connection lost - {}", message);
                self.record(SessionFailure::ConnectionLost(message));
                self.set_state(ConnectionState::ConnectionLost);
            }
        }
    }

    // ---- subscription coordinator ----

    pub fn subscribe(&mut self, topic: &str) {
        let Some(session) = self.open_session("subscribe") else {
            return;
        };
        if let Err(e) = session.subscribe(topic) {
            error!("MQTT: Unable to Subscribe {}", e);
            self.record(SessionFailure::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            });
        }
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        let Some(session) = self.open_session("unsubscribe") else {
            return;
        };
        if let Err(e) = session.unsubscribe(topic) {
            error!("MQTT: Unable to Unsubscribe {}", e);
            self.record(SessionFailure::Unsubscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            });
        }
    }

    pub fn unsubscribe_all(&mut self) {
        for topic in self.registry.snapshot() {
            self.unsubscribe(&topic);
        }
        self.disconnect();
    }

    fn on_subscribe_ack(&mut self, context: AckContext, result: Result<(), String>) {
        match result {
            Ok(()) => {
                info!("MQTT: Subscribed to - {}", context.topic);
                self.registry.mark_subscribed(&context.topic);
            }
            Err(message) => {
                warn!(
                    "MQTT: Failed to subscribe to - {}\nError message : {}",
                    context.topic, message
                );
                self.record(SessionFailure::Subscribe {
                    topic: context.topic,
                    message,
                });
            }
        }
    }

    fn on_unsubscribe_ack(&mut self, context: AckContext, result: Result<(), String>) {
        match result {
            Ok(()) => {
                info!("MQTT: Unsubscribed from - {}", context.topic);
                self.registry.remove(&context.topic);
            }
            Err(message) => {
                warn!(
                    "MQTT: Failed to unsubscribe from - {}\nError message : {}",
                    context.topic, message
                );
                self.record(SessionFailure::Unsubscribe {
                    topic: context.topic,
                    message,
                });
            }
        }
    }

    // ---- message dispatcher ----

    fn on_message_arrived(&mut self, topic: String, raw: &[u8]) {
        self.messages_received += 1;
        self.last_activity = Some(Local::now());

        match decode_payload(raw) {
            Ok(payload) => {
                debug!(
                    "Topic : {}\nPayload : {}",
                    topic,
                    String::from_utf8_lossy(raw)
                );
                let next = self.inbound.borrow().next(topic, payload);
                self.inbound.send_replace(next);
            }
            Err(e) => {
                error!("onMessageArrived Error on {}: {}", topic, e);
                self.record(SessionFailure::Decode {
                    topic,
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn publish(&mut self, topic: &str, body: String) {
        let Some(session) = self.open_session("publish") else {
            return;
        };
        match session.send(OutboundMessage::new(topic, body)) {
            Ok(()) => {
                self.messages_sent += 1;
                self.last_activity = Some(Local::now());
            }
            Err(e) => {
                error!("MQTT: Unable to publish to {}: {}", topic, e);
                self.record(SessionFailure::Publish {
                    topic: topic.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn toggle(&mut self, device: &str) {
        match DeviceCommand::toggle(device).to_body() {
            Ok(body) => {
                let topic = self.config.command_topic();
                self.publish(&topic, body);
            }
            Err(e) => error!("Failed to serialize toggle command: {}", e),
        }
    }

    // ---- helpers ----

    /// The open session when connected; otherwise records why the operation
    /// could not run
    fn open_session(&mut self, operation: &'static str) -> Option<&mut Session<Open>> {
        let connected = self.state == ConnectionState::Connected;
        match self.session.as_mut().and_then(ActiveSession::as_open) {
            Some(session) if connected => Some(session),
            _ => {
                warn!("MQTT: Cannot {} without an active connection", operation);
                push_bounded(&mut self.failures, SessionFailure::NotConnected(operation));
                None
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn record(&mut self, failure: SessionFailure) {
        push_bounded(&mut self.failures, failure);
    }

    /// Updates the published status in place, copying only the parts that
    /// changed. Watchers are woken only when something did.
    fn publish_status(&self) {
        self.status.send_if_modified(|status| {
            let mut modified = false;

            if status.connection_state != self.state {
                status.connection_state = self.state;
                modified = true;
            }

            let client_id = self.session.as_ref().map(ActiveSession::client_id);
            if status.client_id.as_deref() != client_id {
                status.client_id = client_id.map(str::to_string);
                modified = true;
            }

            let broker = self.session.as_ref().map(ActiveSession::endpoint);
            if status.broker.as_ref().map(|(host, port)| (host.as_str(), *port)) != broker {
                status.broker = broker.map(|(host, port)| (host.to_string(), port));
                modified = true;
            }

            if status.topics != *self.registry.entries() {
                status.topics = self.registry.entries().clone();
                modified = true;
            }

            if status.failures != self.failures {
                status.failures = self.failures.clone();
                modified = true;
            }

            if status.messages_received != self.messages_received
                || status.messages_sent != self.messages_sent
                || status.last_activity != self.last_activity
            {
                status.messages_received = self.messages_received;
                status.messages_sent = self.messages_sent;
                status.last_activity = self.last_activity;
                modified = true;
            }

            modified
        });
    }
}

fn push_bounded(failures: &mut VecDeque<SessionFailure>, failure: SessionFailure) {
    if failures.len() == FAILURE_LOG_CAPACITY {
        failures.pop_front();
    }
    failures.push_back(failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::client_id::FixedClientId;
    use crate::mqtt::error::TransportError;
    use crate::mqtt::transport::Transport;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Connect(ConnectOptions),
        Subscribe(String),
        Unsubscribe(String),
        Send(OutboundMessage),
        Disconnect,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        sinks: Arc<Mutex<Vec<EventSink>>>,
        fail_requests: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn sink(&self) -> EventSink {
            self.sinks.lock().unwrap().last().cloned().unwrap()
        }

        fn subscribed(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Subscribe(t) => Some(t),
                    _ => None,
                })
                .collect()
        }
    }

    struct MockTransport(Recorder);

    impl MockTransport {
        fn request(&self, call: Call) -> Result<(), TransportError> {
            if *self.0.fail_requests.lock().unwrap() {
                return Err(TransportError::Request("queue full".to_string()));
            }
            self.0.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn subscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError> {
            assert_eq!(context.topic, topic);
            self.request(Call::Subscribe(topic.to_string()))
        }

        fn unsubscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError> {
            assert_eq!(context.topic, topic);
            self.request(Call::Unsubscribe(topic.to_string()))
        }

        fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
            self.request(Call::Send(message))
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            self.0.calls.lock().unwrap().push(Call::Disconnect);
            Ok(())
        }
    }

    struct MockConnector(Recorder);

    impl Connector for MockConnector {
        fn connect(
            &mut self,
            options: &ConnectOptions,
            events: EventSink,
        ) -> Result<Box<dyn Transport>, TransportError> {
            self.0.calls.lock().unwrap().push(Call::Connect(options.clone()));
            self.0.sinks.lock().unwrap().push(events);
            Ok(Box::new(MockTransport(self.0.clone())))
        }
    }

    struct Harness {
        coordinator: SessionCoordinator,
        receiver: mpsc::Receiver<SessionEvent>,
        recorder: Recorder,
    }

    impl Harness {
        fn new(config: MqttConfig) -> Self {
            let recorder = Recorder::default();
            let (sender, receiver) = mpsc::channel(64);
            let coordinator = SessionCoordinator::new(
                config,
                Box::new(MockConnector(recorder.clone())),
                Box::new(FixedClientId("IOT_F_fixed".to_string())),
                sender,
            );
            Self {
                coordinator,
                receiver,
                recorder,
            }
        }

        fn command(&mut self, command: Command) {
            self.coordinator.handle(SessionEvent::Command(command));
        }

        /// Emits through the live transport's sink and drains the channel
        fn transport(&mut self, event: TransportEvent) {
            self.recorder.sink().try_emit(event).unwrap();
            while let Ok(event) = self.receiver.try_recv() {
                self.coordinator.handle(event);
            }
        }

        fn ack_subscribe(&mut self, topic: &str, result: Result<(), String>) {
            self.transport(TransportEvent::SubscribeAck {
                context: AckContext::for_topic(topic),
                result,
            });
        }

        fn connected(config: MqttConfig) -> Self {
            let mut harness = Self::new(config);
            harness.command(Command::Connect {
                host: "localhost".to_string(),
                port: 1883,
            });
            harness.transport(TransportEvent::ConnectCompleted { reconnect: false });
            harness
        }
    }

    fn config() -> MqttConfig {
        MqttConfig {
            device_id: "dev".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn initial_connect_subscribes_update_topic_only() {
        let mut h = Harness::new(config());
        h.command(Command::Connect {
            host: "broker".to_string(),
            port: 1883,
        });
        assert_eq!(h.coordinator.state(), ConnectionState::Connecting);

        h.transport(TransportEvent::ConnectCompleted { reconnect: false });
        assert_eq!(h.coordinator.state(), ConnectionState::Connected);
        assert_eq!(h.recorder.subscribed(), vec!["dev_pub"]);

        h.ack_subscribe("dev_pub", Ok(()));
        let entries: Vec<_> = h.coordinator.registry().entries().clone().into_iter().collect();
        assert_eq!(
            entries,
            vec![("dev_pub".to_string(), SubscriptionStatus::Subscribed)]
        );
    }

    #[test]
    fn connect_uses_generated_id_and_fixed_options() {
        let h = Harness::connected(config());
        let Some(Call::Connect(options)) = h.recorder.calls().into_iter().next() else {
            panic!("first call should be a connect");
        };
        assert_eq!(options.client_id, "IOT_F_fixed");
        assert_eq!(options.connect_timeout, std::time::Duration::from_secs(5));
        assert!(!options.use_ssl);
        assert!(options.auto_reconnect);
    }

    #[test]
    fn subscribe_ack_success_and_failure() {
        let mut h = Harness::connected(config());
        h.command(Command::Subscribe("a".to_string()));
        h.ack_subscribe("a", Ok(()));
        assert_eq!(
            h.coordinator.registry().status("a"),
            Some(SubscriptionStatus::Subscribed)
        );

        let before = h.coordinator.registry().clone();
        h.command(Command::Subscribe("b".to_string()));
        h.ack_subscribe("b", Err("not authorized".to_string()));
        assert_eq!(h.coordinator.registry(), &before);
        assert_eq!(
            h.coordinator.failures().back(),
            Some(&SessionFailure::Subscribe {
                topic: "b".to_string(),
                message: "not authorized".to_string(),
            })
        );
    }

    #[test]
    fn duplicate_subscribe_keeps_one_entry() {
        let mut h = Harness::connected(config());
        h.command(Command::Subscribe("a".to_string()));
        h.command(Command::Subscribe("a".to_string()));
        h.ack_subscribe("a", Ok(()));
        h.ack_subscribe("a", Ok(()));

        assert_eq!(h.coordinator.registry().snapshot(), vec!["a"]);
    }

    #[test]
    fn reconnect_replays_registry_without_duplicates() {
        let mut h = Harness::connected(config());
        h.ack_subscribe("dev_pub", Ok(()));
        for topic in ["a", "b"] {
            h.command(Command::Subscribe(topic.to_string()));
            h.ack_subscribe(topic, Ok(()));
        }
        h.recorder.clear();

        h.transport(TransportEvent::ConnectionLost(LossReason::Error(
            "broken pipe".to_string(),
        )));
        assert_eq!(h.coordinator.state(), ConnectionState::ConnectionLost);
        assert_eq!(h.coordinator.registry().len(), 3);

        h.transport(TransportEvent::Reconnecting);
        assert_eq!(h.coordinator.state(), ConnectionState::Reconnecting);

        h.transport(TransportEvent::ConnectCompleted { reconnect: true });
        let mut requested = h.recorder.subscribed();
        requested.sort();
        assert_eq!(requested, vec!["a", "b", "dev_pub"]);
        assert_eq!(h.coordinator.state(), ConnectionState::Connected);
    }

    #[test]
    fn seeded_topics_wait_for_reconnect_by_default() {
        let mut h = Harness::connected(MqttConfig {
            seed_topics: vec!["seed".to_string()],
            ..config()
        });
        assert_eq!(h.recorder.subscribed(), vec!["dev_pub"]);
        assert_eq!(
            h.coordinator.registry().status("seed"),
            Some(SubscriptionStatus::Pending)
        );

        h.transport(TransportEvent::ConnectCompleted { reconnect: true });
        assert!(h.recorder.subscribed().contains(&"seed".to_string()));
    }

    #[test]
    fn every_connect_policy_replays_seeds_immediately() {
        let h = Harness::connected(MqttConfig {
            seed_topics: vec!["seed".to_string()],
            replay_policy: ReplayPolicy::EveryConnect,
            ..config()
        });
        assert_eq!(h.recorder.subscribed(), vec!["dev_pub", "seed"]);
    }

    #[test]
    fn malformed_payload_keeps_previous_record() {
        let mut h = Harness::connected(config());
        h.transport(TransportEvent::MessageArrived {
            topic: "dev_pub".to_string(),
            payload: br#"{"id":"dev","number":3}"#.to_vec(),
        });
        let good = h.coordinator.inbound();
        assert_eq!(good.topic, "dev_pub");

        h.transport(TransportEvent::MessageArrived {
            topic: "other".to_string(),
            payload: b"{oops".to_vec(),
        });

        assert_eq!(h.coordinator.inbound(), good);
        assert!(matches!(
            h.coordinator.failures().back(),
            Some(SessionFailure::Decode { topic, .. }) if topic == "other"
        ));
    }

    #[test]
    fn unsubscribe_all_unsubscribes_snapshot_then_disconnects() {
        let mut h = Harness::connected(config());
        for topic in ["a", "b", "c"] {
            h.coordinator.registry.mark_subscribed(topic);
        }
        h.recorder.clear();

        h.command(Command::UnsubscribeAll);

        assert_eq!(
            h.recorder.calls(),
            vec![
                Call::Unsubscribe("a".to_string()),
                Call::Unsubscribe("b".to_string()),
                Call::Unsubscribe("c".to_string()),
                Call::Disconnect,
            ]
        );
        assert_eq!(h.coordinator.state(), ConnectionState::Disconnected);
        assert_eq!(h.coordinator.active_generation(), None);
    }

    #[test]
    fn unsubscribe_ack_removes_entry_and_failure_keeps_it() {
        let mut h = Harness::connected(config());
        h.command(Command::Subscribe("a".to_string()));
        h.ack_subscribe("a", Ok(()));
        h.command(Command::Subscribe("b".to_string()));
        h.ack_subscribe("b", Ok(()));

        h.command(Command::Unsubscribe("a".to_string()));
        h.transport(TransportEvent::UnsubscribeAck {
            context: AckContext::for_topic("a"),
            result: Ok(()),
        });
        h.command(Command::Unsubscribe("b".to_string()));
        h.transport(TransportEvent::UnsubscribeAck {
            context: AckContext::for_topic("b"),
            result: Err("timeout".to_string()),
        });

        assert!(!h.coordinator.registry().contains("a"));
        assert!(h.coordinator.registry().contains("b"));
    }

    #[test]
    fn toggle_publishes_exact_body_to_command_topic() {
        let mut h = Harness::connected(config());
        h.recorder.clear();

        h.command(Command::Toggle("ledA".to_string()));

        assert_eq!(
            h.recorder.calls(),
            vec![Call::Send(OutboundMessage::new(
                "dev_sub",
                r#"{"type":"toggle","device":"ledA"}"#
            ))]
        );
    }

    #[test]
    fn operations_without_session_fail_cleanly() {
        let mut h = Harness::new(config());
        h.command(Command::Subscribe("a".to_string()));
        h.command(Command::Publish {
            topic: "t".to_string(),
            body: "{}".to_string(),
        });
        h.command(Command::Disconnect);

        assert!(h.recorder.calls().is_empty());
        let failures: Vec<_> = h.coordinator.failures().iter().cloned().collect();
        assert_eq!(
            failures,
            vec![
                SessionFailure::NotConnected("subscribe"),
                SessionFailure::NotConnected("publish"),
                SessionFailure::NotConnected("disconnect"),
            ]
        );
    }

    #[test]
    fn requests_before_connect_completed_are_rejected() {
        let mut h = Harness::new(config());
        h.command(Command::Connect {
            host: "localhost".to_string(),
            port: 1883,
        });
        h.command(Command::Subscribe("early".to_string()));

        assert!(h.recorder.subscribed().is_empty());
        assert_eq!(
            h.coordinator.failures().back(),
            Some(&SessionFailure::NotConnected("subscribe"))
        );
    }

    #[test]
    fn transport_request_errors_are_recorded_per_topic() {
        let mut h = Harness::connected(config());
        *h.recorder.fail_requests.lock().unwrap() = true;

        h.command(Command::Subscribe("a".to_string()));

        assert!(matches!(
            h.coordinator.failures().back(),
            Some(SessionFailure::Subscribe { topic, .. }) if topic == "a"
        ));
        assert!(!h.coordinator.registry().contains("a"));
    }

    #[test]
    fn stale_acks_after_disconnect_are_ignored() {
        let mut h = Harness::connected(config());
        h.command(Command::Subscribe("a".to_string()));
        let old_sink = h.recorder.sink();
        h.command(Command::Disconnect);

        old_sink
            .try_emit(TransportEvent::SubscribeAck {
                context: AckContext::for_topic("a"),
                result: Ok(()),
            })
            .unwrap();
        while let Ok(event) = h.receiver.try_recv() {
            h.coordinator.handle(event);
        }

        assert!(!h.coordinator.registry().contains("a"));
    }

    #[test]
    fn requested_loss_is_silent() {
        let mut h = Harness::connected(config());
        let failures_before = h.coordinator.failures().len();

        h.transport(TransportEvent::ConnectionLost(LossReason::Requested));

        assert_eq!(h.coordinator.failures().len(), failures_before);
        assert_eq!(h.coordinator.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_failure_records_endpoint() {
        let mut h = Harness::new(config());
        h.command(Command::Connect {
            host: "nowhere".to_string(),
            port: 1884,
        });
        h.transport(TransportEvent::ConnectFailed {
            host: "nowhere".to_string(),
            port: 1884,
            message: "connection refused".to_string(),
        });

        assert_eq!(
            h.coordinator.failures().back(),
            Some(&SessionFailure::Connect {
                host: "nowhere".to_string(),
                port: 1884,
                message: "connection refused".to_string(),
            })
        );
    }

    #[test]
    fn reconnecting_replaces_the_session() {
        let mut h = Harness::connected(config());
        let first = h.coordinator.active_generation();
        h.command(Command::Connect {
            host: "other".to_string(),
            port: 1883,
        });

        assert!(h.recorder.calls().contains(&Call::Disconnect));
        assert_ne!(h.coordinator.active_generation(), first);
        assert_eq!(h.coordinator.state(), ConnectionState::Connecting);
    }

    #[test]
    fn status_snapshot_tracks_registry_and_counters() {
        let mut h = Harness::connected(config());
        let status = h.coordinator.subscribe_status();
        h.ack_subscribe("dev_pub", Ok(()));
        h.command(Command::Publish {
            topic: "x".to_string(),
            body: "1".to_string(),
        });

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.client_id.as_deref(), Some("IOT_F_fixed"));
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(
            snapshot.topics.get("dev_pub"),
            Some(&SubscriptionStatus::Subscribed)
        );
    }

    #[test]
    fn failure_log_is_bounded() {
        let mut h = Harness::new(config());
        for _ in 0..FAILURE_LOG_CAPACITY + 5 {
            h.command(Command::Disconnect);
        }
        assert_eq!(h.coordinator.failures().len(), FAILURE_LOG_CAPACITY);
    }

    #[test]
    fn ignored_events_do_not_wake_status_watchers() {
        let mut h = Harness::connected(config());
        let mut status = h.coordinator.subscribe_status();
        status.mark_unchanged();

        h.coordinator.handle(SessionEvent::Transport {
            generation: 0,
            event: TransportEvent::SubscribeAck {
                context: AckContext::for_topic("dev_pub"),
                result: Ok(()),
            },
        });
        assert!(!status.has_changed().unwrap());

        h.transport(TransportEvent::Reconnecting);
        assert!(status.has_changed().unwrap());
        assert_eq!(
            status.borrow_and_update().connection_state,
            ConnectionState::Reconnecting
        );
    }

    #[test]
    fn full_failure_log_still_publishes_newest_failure() {
        let mut h = Harness::new(config());
        for _ in 0..FAILURE_LOG_CAPACITY {
            h.command(Command::Disconnect);
        }
        let status = h.coordinator.subscribe_status();

        h.command(Command::Subscribe("late".to_string()));

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.failures.len(), FAILURE_LOG_CAPACITY);
        assert_eq!(
            snapshot.last_failure(),
            Some(&SessionFailure::NotConnected("subscribe"))
        );
        assert_eq!(
            snapshot.last_failure().map(ToString::to_string),
            Some("No active connection for subscribe".to_string())
        );
    }
}
