//! MQTT session manager for a telemetry UI client.
//!
//! The [`mqtt`] module holds the core: one auto-recovering broker session,
//! a topic registry that is replayed after reconnects, and decoding of the
//! latest inbound message. [`persistence`] and [`config`] cover the small
//! amount of state that lives on disk.

pub mod config;
pub mod console;
pub mod mqtt;
pub mod persistence;
