// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]

//! Photon - Asynchronous MQTT 3.1.1 client engine.
//!
//! The session-level protocol engine of an MQTT 3.1.1 client: the
//! connect/keep-alive lifecycle, the request/response correlation
//! dispatcher, the inbound and outbound QoS flow state machines, and
//! packet-identifier management. Byte-level packet framing and the socket
//! layer live behind the [`PacketTransport`] seam and are supplied by the
//! host.
//!
//! # Module Organization
//!
//! - `config` - Client options, parsing defaults, validation
//! - `protocol` - Typed MQTT 3.1.1 control-packet model
//! - `transport` - The transport adapter trait consumed by the engine
//! - `session` - Session controller, receive loop, keep-alive, dispatcher
//! - `events` - Events surfaced to the host application
//! - `error` - The session-level error surface

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::MqttClientOptions;
pub use error::{MqttError, Result};
pub use events::{ApplicationMessage, ClientEvent};
pub use protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PacketType, PublishPacket, Qos,
    SubAckPacket, SubscribePacket, SubscribeReturnCode, SubscriptionGrant, TopicFilter,
    UnsubscribePacket, Will,
};
pub use session::MqttClient;
pub use transport::{PacketTransport, TransportError};
