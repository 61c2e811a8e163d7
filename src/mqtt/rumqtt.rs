//! `rumqttc` implementation of the transport seam
//!
//! The client half queues requests; a spawned task polls the event loop and
//! turns what it sees into [`TransportEvent`]s. rumqttc reports packet ids
//! only on the outgoing side, so acknowledgement contexts are queued in
//! request order and bound to a packet id when the request leaves.
//!
//! The driver task lives until its transport is disconnected or dropped. An
//! online driver first gets to send the DISCONNECT packet; an offline one
//! stops right away.

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, Request,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::TransportError;
use super::transport::{
    AckContext, ConnectOptions, Connector, EventSink, LossReason, OutboundMessage, Transport,
    TransportEvent,
};

/// Capacity of rumqttc's request channel
const REQUEST_CAPACITY: usize = 100;

#[derive(Default, Debug)]
struct AckQueues {
    subscribe: VecDeque<AckContext>,
    unsubscribe: VecDeque<AckContext>,
}

type SharedQueues = Arc<Mutex<AckQueues>>;

fn lock(queues: &SharedQueues) -> MutexGuard<'_, AckQueues> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens rumqttc connections over plain TCP
#[derive(Clone, Debug, Default)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    fn connect(
        &mut self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if options.use_ssl {
            return Err(TransportError::Connect(
                "TLS connections are not supported".to_string(),
            ));
        }

        let (client, event_loop) = new_client(options);
        let queues = SharedQueues::default();
        let closing = CancellationToken::new();
        let driver = Driver::new(options.clone(), events, queues.clone(), closing.clone());
        tokio::spawn(driver.run(event_loop));

        info!("MQTT transport started for {}", options.uri());
        Ok(Box::new(RumqttTransport {
            client,
            queues,
            closing,
        }))
    }
}

/// Client and event loop for one session. rumqttc's own connect timeout
/// covers reconnect attempts too.
fn new_client(options: &ConnectOptions) -> (AsyncClient, EventLoop) {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
    mqtt_options
        .set_keep_alive(options.keep_alive)
        .set_clean_session(true);

    let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
    event_loop
        .network_options
        .set_connection_timeout(options.connect_timeout.as_secs().max(1));
    (client, event_loop)
}

pub struct RumqttTransport {
    client: AsyncClient,
    queues: SharedQueues,
    closing: CancellationToken,
}

impl Transport for RumqttTransport {
    fn subscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError> {
        // Hold the queue while enqueuing so the driver cannot see the
        // outgoing packet before its context is queued.
        let mut queues = lock(&self.queues);
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        queues.subscribe.push_back(context);
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str, context: AckContext) -> Result<(), TransportError> {
        let mut queues = lock(&self.queues);
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Request(e.to_string()))?;
        queues.unsubscribe.push_back(context);
        Ok(())
    }

    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        self.client
            .try_publish(message.topic, QoS::AtMostOnce, false, message.payload)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let queued = self
            .client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()));
        self.closing.cancel();
        queued
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

struct Driver {
    options: ConnectOptions,
    events: EventSink,
    queues: SharedQueues,
    awaiting_subscribe: HashMap<u16, AckContext>,
    awaiting_unsubscribe: HashMap<u16, AckContext>,
    connected_once: bool,
    online: bool,
    closing: CancellationToken,
}

impl Driver {
    fn new(
        options: ConnectOptions,
        events: EventSink,
        queues: SharedQueues,
        closing: CancellationToken,
    ) -> Self {
        Self {
            options,
            events,
            queues,
            awaiting_subscribe: HashMap::new(),
            awaiting_unsubscribe: HashMap::new(),
            connected_once: false,
            online: false,
            closing,
        }
    }

    async fn run(mut self, mut event_loop: EventLoop) {
        loop {
            let polled = if self.closing.is_cancelled() {
                if !self.online {
                    debug!("Transport closed while offline");
                    break;
                }
                match tokio::time::timeout(self.options.connect_timeout, event_loop.poll()).await {
                    Ok(polled) => polled,
                    Err(_) => {
                        debug!("Disconnect not sent in time, dropping connection");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    polled = self.poll(&mut event_loop) => polled,
                    _ = self.closing.cancelled() => continue,
                }
            };

            match polled {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent to broker");
                    self.emit(TransportEvent::ConnectionLost(LossReason::Requested))
                        .await;
                    break;
                }
                Ok(event) => {
                    if !self.on_event(event).await {
                        break;
                    }
                }
                Err(e) if self.closing.is_cancelled() => {
                    debug!("Connection ended while closing: {}", e);
                    break;
                }
                Err(e) => {
                    if !self.on_error(&mut event_loop, e).await {
                        break;
                    }
                    if !self.options.auto_reconnect {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                        _ = self.closing.cancelled() => break,
                    }
                    if self.connected_once {
                        self.emit(TransportEvent::Reconnecting).await;
                    }
                }
            }
        }
        debug!("MQTT driver for {} stopped", self.options.client_id);
    }

    /// Polls once; attempts before the first ConnAck are bounded by the
    /// connect timeout
    async fn poll(&self, event_loop: &mut EventLoop) -> Result<Event, ConnectionError> {
        if self.connected_once {
            return event_loop.poll().await;
        }
        tokio::time::timeout(self.options.connect_timeout, event_loop.poll())
            .await
            .unwrap_or(Err(ConnectionError::NetworkTimeout))
    }

    /// Returns false once the coordinator is gone
    async fn on_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                debug!("ConnAck received: {:?}", ack.code);
                let reconnect = self.connected_once;
                self.connected_once = true;
                self.online = true;
                self.emit(TransportEvent::ConnectCompleted { reconnect })
                    .await
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                self.emit(TransportEvent::MessageArrived {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
                .await
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                let Some(context) = self.awaiting_subscribe.remove(&ack.pkid) else {
                    debug!("SubAck for untracked packet {}", ack.pkid);
                    return true;
                };
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err("broker rejected the subscription".to_string())
                } else {
                    Ok(())
                };
                self.emit(TransportEvent::SubscribeAck { context, result })
                    .await
            }
            Event::Incoming(Incoming::UnsubAck(ack)) => {
                let Some(context) = self.awaiting_unsubscribe.remove(&ack.pkid) else {
                    debug!("UnsubAck for untracked packet {}", ack.pkid);
                    return true;
                };
                self.emit(TransportEvent::UnsubscribeAck {
                    context,
                    result: Ok(()),
                })
                .await
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let queued = lock(&self.queues).subscribe.pop_front();
                match queued {
                    Some(context) => {
                        self.awaiting_subscribe.insert(pkid, context);
                    }
                    None => debug!("Subscribe packet {} has no queued context", pkid),
                }
                true
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let queued = lock(&self.queues).unsubscribe.pop_front();
                match queued {
                    Some(context) => {
                        self.awaiting_unsubscribe.insert(pkid, context);
                    }
                    None => debug!("Unsubscribe packet {} has no queued context", pkid),
                }
                true
            }
            _ => true,
        }
    }

    /// Reports a poll error; returns false once the coordinator is gone
    async fn on_error(&mut self, event_loop: &mut EventLoop, e: ConnectionError) -> bool {
        let message = e.to_string();
        self.fail_outstanding(event_loop, &message).await;

        if !self.connected_once {
            error!(
                "Connect attempt to {} failed: {}",
                self.options.uri(),
                message
            );
            return self
                .emit(TransportEvent::ConnectFailed {
                    host: self.options.host.clone(),
                    port: self.options.port,
                    message,
                })
                .await;
        }

        if self.online {
            self.online = false;
            return self
                .emit(TransportEvent::ConnectionLost(LossReason::Error(message)))
                .await;
        }

        debug!("Reconnect attempt failed: {}", message);
        !self.events.is_closed()
    }

    /// Fails every request whose acknowledgement can no longer arrive.
    ///
    /// Subscribe and unsubscribe requests that never left are dropped from
    /// the event loop along with their contexts, so packets resent after a
    /// reconnect cannot take contexts queued by later requests. Publishes
    /// stay pending.
    async fn fail_outstanding(&mut self, event_loop: &mut EventLoop, message: &str) {
        let (queued_subscribe, queued_unsubscribe) = {
            let mut queues = lock(&self.queues);
            // Requests still in the channel move to `pending` first
            event_loop.clean();
            event_loop.pending.retain(|request| {
                !matches!(request, Request::Subscribe(_) | Request::Unsubscribe(_))
            });
            (
                std::mem::take(&mut queues.subscribe),
                std::mem::take(&mut queues.unsubscribe),
            )
        };

        let subscribes: Vec<AckContext> = self
            .awaiting_subscribe
            .drain()
            .map(|(_, context)| context)
            .chain(queued_subscribe)
            .collect();
        let unsubscribes: Vec<AckContext> = self
            .awaiting_unsubscribe
            .drain()
            .map(|(_, context)| context)
            .chain(queued_unsubscribe)
            .collect();

        for context in subscribes {
            self.emit(TransportEvent::SubscribeAck {
                context,
                result: Err(message.to_string()),
            })
            .await;
        }
        for context in unsubscribes {
            self.emit(TransportEvent::UnsubscribeAck {
                context,
                result: Err(message.to_string()),
            })
            .await;
        }
    }

    async fn emit(&self, event: TransportEvent) -> bool {
        match self.events.emit(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!("Coordinator dropped, stopping MQTT driver");
                false
            }
        }
    }
}
