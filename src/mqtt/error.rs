//! Error types for the MQTT session core

use thiserror::Error;

/// Errors returned by [`SessionHandle`](super::SessionHandle) calls. Failures
/// inside the session are recorded in its status instead.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The coordinating task has stopped and no longer accepts commands
    #[error("Session task is no longer running")]
    ChannelClosed,
}

/// Errors reported by a transport implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection setup failed: {0}")]
    Connect(String),

    #[error("Request could not be queued: {0}")]
    Request(String),

    #[error("Transport is closed")]
    Closed,
}

/// Reasons an inbound payload could not be turned into a structured record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is JSON but not an object (found {0})")]
    NotAnObject(&'static str),
}
