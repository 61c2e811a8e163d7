//! Single broker session with statum typestates
//!
//! ```text
//! Opening ──established()──► Open ──close()──► (dropped)
//!    └───────────close()───────────┘
//! ```
//!
//! Requests that need a live broker connection (subscribe, unsubscribe,
//! send) only exist on `Session<Open>`.

use statum::{machine, state};
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::transport::{AckContext, OutboundMessage, Transport};

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Opening, // connect issued, waiting for the broker
    Open,    // broker accepted at least once
}

#[machine]
pub struct Session<S: SessionState> {
    host: String,
    port: u16,
    client_id: String,
    generation: u64,
    transport: Box<dyn Transport>,
}

impl<S: SessionState> Session<S> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tears the connection down; the session is consumed
    pub fn close(mut self) {
        info!(
            "Closing session {} to {}:{}",
            self.client_id, self.host, self.port
        );
        if let Err(e) = self.transport.disconnect() {
            warn!("Disconnect request failed: {}", e);
        }
    }
}

impl Session<Opening> {
    pub fn opening(
        host: String,
        port: u16,
        client_id: String,
        generation: u64,
        transport: Box<dyn Transport>,
    ) -> Self {
        debug!("Session {} (generation {}) opening", client_id, generation);
        Self::new(host, port, client_id, generation, transport)
    }

    pub fn established(self) -> Session<Open> {
        debug!("Session {} established", self.client_id);
        self.transition()
    }
}

impl Session<Open> {
    pub fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.transport
            .subscribe(topic, AckContext::for_topic(topic))
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.transport
            .unsubscribe(topic, AckContext::for_topic(topic))
    }

    pub fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        self.transport.send(message)
    }
}

/// The coordinator's view of its current session, whatever its state
pub enum ActiveSession {
    Opening(Session<Opening>),
    Open(Session<Open>),
}

impl ActiveSession {
    pub fn generation(&self) -> u64 {
        match self {
            ActiveSession::Opening(s) => s.generation(),
            ActiveSession::Open(s) => s.generation(),
        }
    }

    pub fn endpoint(&self) -> (&str, u16) {
        match self {
            ActiveSession::Opening(s) => (s.host(), s.port()),
            ActiveSession::Open(s) => (s.host(), s.port()),
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            ActiveSession::Opening(s) => s.client_id(),
            ActiveSession::Open(s) => s.client_id(),
        }
    }

    /// Moves an opening session to open; open sessions pass through
    pub fn establish(self) -> Self {
        match self {
            ActiveSession::Opening(s) => ActiveSession::Open(s.established()),
            open => open,
        }
    }

    pub fn as_open(&mut self) -> Option<&mut Session<Open>> {
        match self {
            ActiveSession::Open(s) => Some(s),
            ActiveSession::Opening(_) => None,
        }
    }

    pub fn close(self) {
        match self {
            ActiveSession::Opening(s) => s.close(),
            ActiveSession::Open(s) => s.close(),
        }
    }
}
