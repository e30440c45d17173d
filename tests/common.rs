//! Common test harness utilities for integration tests.
//!
//! Provides a scripted in-process transport: the test drives the broker
//! side of the session over a pair of channels, no sockets involved.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use async_trait::async_trait;
use photon::protocol::{ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet};
use photon::transport::{PacketTransport, TransportError};
use photon::{ClientEvent, MqttClientOptions};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport half handed to the client under test.
pub struct ScriptedTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

/// Broker half kept by the test.
pub struct BrokerEnd {
    pub to_client: mpsc::UnboundedSender<Packet>,
    pub from_client: mpsc::UnboundedReceiver<Packet>,
}

pub fn scripted_transport() -> (ScriptedTransport, BrokerEnd) {
    init_tracing();
    let (to_client, inbound) = mpsc::unbounded_channel();
    let (outbound, from_client) = mpsc::unbounded_channel();
    (
        ScriptedTransport {
            inbound: Mutex::new(inbound),
            outbound,
        },
        BrokerEnd {
            to_client,
            from_client,
        },
    )
}

#[async_trait]
impl PacketTransport for ScriptedTransport {
    async fn connect(&self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_packet(&self, packet: Packet, _timeout: Duration) -> Result<(), TransportError> {
        self.outbound
            .send(packet)
            .map_err(|_| TransportError::Closed)
    }

    async fn receive_packet(&self, timeout: Duration) -> Result<Packet, TransportError> {
        let mut inbound = self.inbound.lock().await;
        if timeout.is_zero() {
            inbound.recv().await.ok_or(TransportError::Closed)
        } else {
            match tokio::time::timeout(timeout, inbound.recv()).await {
                Ok(Some(packet)) => Ok(packet),
                Ok(None) => Err(TransportError::Closed),
                Err(_) => Err(TransportError::Timeout),
            }
        }
    }
}

/// Options tuned for tests: keep-alive off, short timeouts.
pub fn test_options(client_id: &str) -> MqttClientOptions {
    let mut options = MqttClientOptions::new(client_id);
    options.keep_alive_period = Duration::ZERO;
    options.default_communication_timeout = Duration::from_millis(500);
    options
}

pub fn connack(return_code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAckPacket {
        session_present: false,
        return_code,
    })
}

/// Next packet the client wrote, failing the test after one second.
pub async fn expect_packet(broker: &mut BrokerEnd) -> Packet {
    tokio::time::timeout(Duration::from_secs(1), broker.from_client.recv())
        .await
        .expect("timed out waiting for a client packet")
        .expect("client transport closed")
}

/// Next event on the client's event channel, failing the test after the
/// given deadline.
pub async fn expect_event(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    deadline: Duration,
) -> ClientEvent {
    tokio::time::timeout(deadline, events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

/// Consumes the client's CONNECT and answers with an accepting CONNACK.
pub async fn accept_connect(broker: &mut BrokerEnd) -> ConnectPacket {
    match expect_packet(broker).await {
        Packet::Connect(connect) => {
            broker
                .to_client
                .send(connack(ConnectReturnCode::Accepted))
                .expect("client receive loop gone");
            connect
        }
        other => panic!("expected CONNECT, got {other:?}"),
    }
}
