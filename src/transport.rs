//! Transport adapter seam.
//!
//! The engine is transport-agnostic: TCP, TLS, or WebSocket adapters all
//! sit behind [`PacketTransport`]. Implementations own the socket-level
//! connect handshake and the byte-level packet codec.

use crate::protocol::Packet;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying stream was closed by either side.
    #[error("transport closed")]
    Closed,

    /// The per-operation deadline elapsed.
    #[error("transport operation timed out")]
    Timeout,

    /// Any other I/O failure.
    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Stream transport consumed by the session engine.
///
/// `send_packet` serializes and writes a whole control packet;
/// `receive_packet` blocks until a whole packet is framed off the stream.
/// A `timeout` of [`Duration::ZERO`] passed to `receive_packet` means no
/// read deadline (the keep-alive loop enforces liveness instead).
#[async_trait]
pub trait PacketTransport: Send + Sync + 'static {
    async fn connect(&self, timeout: Duration) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn send_packet(&self, packet: Packet, timeout: Duration) -> Result<(), TransportError>;

    async fn receive_packet(&self, timeout: Duration) -> Result<Packet, TransportError>;
}
