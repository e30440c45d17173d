//! Events surfaced to the host application.

use crate::protocol::Qos;

/// An application-level message, inbound from a broker PUBLISH or outbound
/// through [`MqttClient::publish`](crate::session::MqttClient::publish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

/// Session events delivered over the channel returned by
/// [`MqttClient::new`](crate::session::MqttClient::new).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// CONNACK accepted; the session is live.
    Connected,
    /// Fired exactly once per teardown.
    Disconnected,
    /// An inbound PUBLISH completed its QoS flow.
    MessageReceived(ApplicationMessage),
}
