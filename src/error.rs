//! Session-level error surface.

use crate::protocol::ConnectReturnCode;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors raised by the session engine.
#[derive(Debug, Error)]
pub enum MqttError {
    /// The broker or a local call violated the MQTT contract.
    #[error("mqtt protocol violation: {0}")]
    ProtocolViolation(String),

    /// CONNACK carried a return code other than `Accepted`.
    #[error("broker refused the connection: {0:?}")]
    ConnectingFailed(ConnectReturnCode),

    /// The transport adapter raised an error.
    #[error("transport communication failed: {0}")]
    CommunicationFailed(String),

    /// A configured timeout elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The operation requires a connected session.
    #[error("client is not connected")]
    NotConnected,

    /// The awaited response was canceled by session teardown.
    #[error("pending operation canceled by session teardown")]
    Canceled,
}

impl From<TransportError> for MqttError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => MqttError::Timeout,
            other => MqttError::CommunicationFailed(other.to_string()),
        }
    }
}
