//! # MQTT Session Module
//!
//! Keeps one live, self-recovering broker connection for a telemetry UI and
//! keeps its subscriptions consistent across reconnects.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker/session settings and topic naming
//! ├── registry.rs         - Topic registry (topic -> subscription status)
//! ├── client_id.rs        - Per-attempt client id generation
//! ├── transport.rs        - Seam to the MQTT client library
//! ├── rumqtt.rs           - rumqttc implementation of the seam
//! ├── session.rs          - Session typestate (Opening -> Open)
//! ├── message_manager.rs  - Payload decoding, inbound record, device commands
//! ├── mqtt_handler.rs     - Coordinator: connection, subscriptions, dispatch
//! └── session_handle.rs   - Spawnable caller-facing handle
//! ```
//!
//! ## Flow
//!
//! 1. `SessionHandle::connect` opens a session with a fresh client id
//! 2. On connect-completed the update topic is subscribed; after a reconnect
//!    every registry topic is subscribed again
//! 3. Acknowledgements update the registry, keyed by topic
//! 4. Inbound frames are decoded and replace the latest inbound record
//! 5. `publish`/`toggle` send over the open session
//!
//! Failures never propagate to callers; they are logged and kept in the
//! status snapshot.

pub mod client_id;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod registry;
pub mod rumqtt;
pub mod session;
pub mod session_handle;
pub mod transport;

pub use config::{MqttConfig, ReplayPolicy};
pub use error::{DecodeError, SessionError, TransportError};
pub use message_manager::{DeviceCommand, InboundRecord, Telemetry};
pub use mqtt_handler::{ConnectionState, SessionFailure, SessionStatus};
pub use registry::{SubscriptionStatus, TopicRegistry};
pub use session_handle::SessionHandle;
