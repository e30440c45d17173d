//! Session controller: connect/disconnect lifecycle, keep-alive, and the
//! public publish/subscribe/unsubscribe operations.
//!
//! A connected session runs two long-lived tasks, the receive loop and the
//! keep-alive loop, plus short-lived per-packet handler tasks spawned by
//! the receive loop. All of them observe a per-episode cancel signal and
//! are joined by a reaper task at teardown.

mod dispatcher;
mod inbound;
mod packet_id;

use crate::config::MqttClientOptions;
use crate::error::{MqttError, Result};
use crate::events::{ApplicationMessage, ClientEvent};
use crate::protocol::{
    ConnectPacket, Packet, PacketType, PublishPacket, Qos, SubscribePacket, SubscriptionGrant,
    TopicFilter, UnsubscribePacket, Will,
};
use crate::transport::{PacketTransport, TransportError};
use dispatcher::PacketDispatcher;
use inbound::{InboundQosTracker, PublishAction, ReleaseAction};
use packet_id::PacketIdAllocator;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Asynchronous MQTT 3.1.1 client.
///
/// Cheap to clone; clones share one session. Events (connection state and
/// inbound application messages) arrive on the channel returned by
/// [`MqttClient::new`].
pub struct MqttClient<T: PacketTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: PacketTransport> Clone for MqttClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<T: PacketTransport> {
    options: MqttClientOptions,
    transport: T,
    connected: AtomicBool,
    packet_ids: PacketIdAllocator,
    dispatcher: PacketDispatcher,
    inbound: InboundQosTracker,
    events: mpsc::UnboundedSender<ClientEvent>,
    /// Live connect episode; `None` whenever torn down. The lock also
    /// serializes connect attempts.
    session: Mutex<Option<SessionTasks>>,
    /// Handles of in-flight per-packet handler tasks, pruned as they
    /// finish and drained into the reaper at teardown.
    handlers: SyncMutex<Vec<JoinHandle<()>>>,
}

struct SessionTasks {
    cancel: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl<T: PacketTransport> MqttClient<T> {
    pub fn new(
        transport: T,
        options: MqttClientOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                options,
                transport,
                connected: AtomicBool::new(false),
                packet_ids: PacketIdAllocator::default(),
                dispatcher: PacketDispatcher::default(),
                inbound: InboundQosTracker::default(),
                events,
                session: Mutex::new(None),
                handlers: SyncMutex::new(Vec::new()),
            }),
        };
        (client, events_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Establishes the session: opens the transport, starts the receive
    /// loop, performs the CONNECT/CONNACK handshake, and on acceptance
    /// starts the keep-alive loop and emits [`ClientEvent::Connected`].
    pub async fn connect(&self, will: Option<Will>) -> Result<()> {
        let inner = &self.inner;
        inner.options.validate()?;

        let mut slot = inner.session.lock().await;
        if slot.is_some() || inner.connected.load(Ordering::SeqCst) {
            return Err(MqttError::ProtocolViolation(
                "connect called on an already connected session".to_string(),
            ));
        }

        inner
            .transport
            .connect(inner.options.default_communication_timeout)
            .await?;

        // Fresh session state for this episode.
        inner.packet_ids.reset();
        inner.dispatcher.reset();
        inner.inbound.clear();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let receive_handle = tokio::spawn(receive_loop(inner.clone(), cancel_rx.clone()));

        let request = Packet::Connect(ConnectPacket {
            client_id: inner.options.client_id.clone(),
            keep_alive_seconds: inner.options.keep_alive_seconds(),
            clean_session: inner.options.clean_session,
            will,
            user_name: inner.options.user_name.clone(),
            password: inner.options.password.clone(),
        });

        let connack = match inner.send_and_receive(request, PacketType::ConnAck).await {
            Ok(Packet::ConnAck(connack)) => connack,
            Ok(other) => {
                abort_connect(inner, cancel_tx, receive_handle).await;
                return Err(MqttError::ProtocolViolation(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
            Err(err) => {
                abort_connect(inner, cancel_tx, receive_handle).await;
                return Err(err);
            }
        };

        if !connack.return_code.is_accepted() {
            abort_connect(inner, cancel_tx, receive_handle).await;
            return Err(MqttError::ConnectingFailed(connack.return_code));
        }

        inner.connected.store(true, Ordering::SeqCst);
        let mut loops = vec![receive_handle];
        if !inner.options.keep_alive_period.is_zero() {
            loops.push(tokio::spawn(keep_alive_loop(inner.clone(), cancel_rx)));
        }
        *slot = Some(SessionTasks {
            cancel: cancel_tx,
            loops,
        });
        inner.emit(ClientEvent::Connected);
        debug!("session established as {}", inner.options.client_id);
        Ok(())
    }

    /// Publishes a message at its QoS level. QoS 0 is fire-and-forget;
    /// QoS 1 awaits PUBACK; QoS 2 runs the full
    /// PUBLISH/PUBREC/PUBREL/PUBCOMP handshake.
    pub async fn publish(&self, message: ApplicationMessage) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        match message.qos {
            Qos::AtMostOnce => {
                inner
                    .send(Packet::Publish(outbound_publish(message, None)))
                    .await
            }
            Qos::AtLeastOnce => {
                let id = inner.packet_ids.next_id();
                let request = Packet::Publish(outbound_publish(message, Some(id)));
                inner.send_and_receive(request, PacketType::PubAck).await?;
                Ok(())
            }
            Qos::ExactlyOnce => {
                let id = inner.packet_ids.next_id();
                let request = Packet::Publish(outbound_publish(message, Some(id)));
                inner.send_and_receive(request, PacketType::PubRec).await?;
                inner
                    .send_and_receive(Packet::PubRel(id), PacketType::PubComp)
                    .await?;
                Ok(())
            }
        }
    }

    /// Subscribes to the given filters and returns the per-filter grants
    /// from SUBACK, in request order.
    pub async fn subscribe(&self, filters: Vec<TopicFilter>) -> Result<Vec<SubscriptionGrant>> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        if filters.is_empty() {
            return Err(MqttError::ProtocolViolation(
                "subscribe requires at least one topic filter".to_string(),
            ));
        }
        let request = Packet::Subscribe(SubscribePacket {
            packet_id: inner.packet_ids.next_id(),
            filters: filters.clone(),
        });
        let suback = match inner.send_and_receive(request, PacketType::SubAck).await? {
            Packet::SubAck(suback) => suback,
            other => {
                return Err(MqttError::ProtocolViolation(format!(
                    "expected SUBACK, got {:?}",
                    other.packet_type()
                )))
            }
        };
        if suback.return_codes.len() != filters.len() {
            return Err(MqttError::ProtocolViolation(format!(
                "SUBACK carried {} return codes for {} filters",
                suback.return_codes.len(),
                filters.len()
            )));
        }
        Ok(filters
            .into_iter()
            .zip(suback.return_codes)
            .map(|(requested, return_code)| SubscriptionGrant {
                filter: requested.filter,
                return_code,
            })
            .collect())
    }

    pub async fn unsubscribe(&self, filters: Vec<String>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        if filters.is_empty() {
            return Err(MqttError::ProtocolViolation(
                "unsubscribe requires at least one topic filter".to_string(),
            ));
        }
        let request = Packet::Unsubscribe(UnsubscribePacket {
            packet_id: inner.packet_ids.next_id(),
            filters,
        });
        inner.send_and_receive(request, PacketType::UnsubAck).await?;
        Ok(())
    }

    /// Sends DISCONNECT best-effort and tears the session down.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        if let Err(err) = inner
            .transport
            .send_packet(
                Packet::Disconnect,
                inner.options.default_communication_timeout,
            )
            .await
        {
            // Expected when the peer already went away.
            debug!("DISCONNECT send failed: {err}");
        }
        inner.disconnect_internal().await;
        Ok(())
    }
}

impl<T: PacketTransport> ClientInner<T> {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    /// Fire-and-forget send under the configured communication timeout.
    async fn send(&self, packet: Packet) -> Result<()> {
        self.transport
            .send_packet(packet, self.options.default_communication_timeout)
            .await
            .map_err(MqttError::from)
    }

    /// Registers a waiter for the matched response, sends the request, and
    /// awaits the waiter under the communication timeout. Identifier
    /// equality is enforced whenever the request carries one.
    async fn send_and_receive(&self, request: Packet, response_type: PacketType) -> Result<Packet> {
        let pending = self.dispatcher.register(response_type, request.packet_id());
        let token = pending.token();
        let deadline = self.options.default_communication_timeout;
        if let Err(err) = self.transport.send_packet(request, deadline).await {
            self.dispatcher.remove(token);
            return Err(err.into());
        }
        match timeout(deadline, pending.recv()).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(MqttError::Canceled),
            Err(_) => {
                self.dispatcher.remove(token);
                Err(MqttError::Timeout)
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn track_handler(&self, handle: JoinHandle<()>) {
        let mut handlers = self.handlers.lock();
        handlers.retain(|handle| !handle.is_finished());
        handlers.push(handle);
    }

    /// Tears the session down. Safe to invoke from every exit path
    /// (caller, receive loop, keep-alive loop): the episode record is
    /// taken under the session lock, so only the first caller acts and
    /// `Disconnected` fires exactly once per connect episode.
    async fn disconnect_internal(&self) {
        let tasks = self.session.lock().await.take();
        let Some(SessionTasks { cancel, mut loops }) = tasks else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        let _ = cancel.send(true);
        self.dispatcher.reset();
        if let Err(err) = self.transport.disconnect().await {
            debug!("transport close during teardown failed: {err}");
        }
        loops.extend(self.handlers.lock().drain(..));
        spawn_reaper(loops);
        self.emit(ClientEvent::Disconnected);
        debug!("session torn down");
    }
}

/// Teardown for a connect attempt that never became a session: no
/// `Disconnected` event, the connected flag was never set.
async fn abort_connect<T: PacketTransport>(
    inner: &Arc<ClientInner<T>>,
    cancel: watch::Sender<bool>,
    receive_handle: JoinHandle<()>,
) {
    let _ = cancel.send(true);
    inner.dispatcher.reset();
    if let Err(err) = inner.transport.disconnect().await {
        debug!("transport close after failed connect: {err}");
    }
    spawn_reaper(vec![receive_handle]);
}

/// Joins finished session tasks off the teardown path, so a task invoking
/// the teardown never waits on itself.
fn spawn_reaper(handles: Vec<JoinHandle<()>>) {
    if handles.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
    });
}

/// Pulls packets off the transport until canceled or the transport fails,
/// then triggers teardown. Protocol-mandated acknowledgments run on
/// spawned handler tasks so a slow flow never blocks subsequent reads.
async fn receive_loop<T: PacketTransport>(
    inner: Arc<ClientInner<T>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.changed() => break,
            received = inner.transport.receive_packet(Duration::ZERO) => match received {
                Ok(packet) => packet,
                Err(TransportError::Closed) => {
                    debug!("transport closed, leaving receive loop");
                    break;
                }
                Err(err) => {
                    warn!("receive loop failed: {err}");
                    break;
                }
            },
        };

        match packet {
            // A client must answer PINGREQ even though brokers rarely send one.
            Packet::PingReq => {
                let inner_for_task = inner.clone();
                inner.track_handler(tokio::spawn(async move {
                    if let Err(err) = inner_for_task.send(Packet::PingResp).await {
                        warn!("PINGRESP send failed: {err}");
                    }
                }));
            }
            Packet::Disconnect => {
                debug!("broker requested disconnect");
                break;
            }
            Packet::Publish(publish) => {
                let inner_for_task = inner.clone();
                inner.track_handler(tokio::spawn(async move {
                    handle_publish(inner_for_task, publish).await;
                }));
            }
            Packet::PubRel(id) => {
                let inner_for_task = inner.clone();
                inner.track_handler(tokio::spawn(async move {
                    handle_pubrel(inner_for_task, id).await;
                }));
            }
            other => inner.dispatcher.dispatch(other),
        }
    }
    inner.disconnect_internal().await;
}

async fn handle_publish<T: PacketTransport>(inner: Arc<ClientInner<T>>, publish: PublishPacket) {
    let packet_id = publish.packet_id;
    let outcome = match inner.inbound.on_publish(&publish) {
        PublishAction::Deliver => {
            inner.emit(ClientEvent::MessageReceived(inbound_message(&publish)));
            Ok(())
        }
        PublishAction::DeliverThenAck { id } => {
            inner.emit(ClientEvent::MessageReceived(inbound_message(&publish)));
            inner.send(Packet::PubAck(id)).await
        }
        PublishAction::AckOnly { id } => inner.send(Packet::PubAck(id)).await,
        PublishAction::Record { id } => inner.send(Packet::PubRec(id)).await,
    };
    if let Err(err) = outcome {
        warn!(
            "inbound PUBLISH (id {:?}, topic {}) handling failed: {err}",
            packet_id, publish.topic
        );
    }
}

async fn handle_pubrel<T: PacketTransport>(inner: Arc<ClientInner<T>>, id: u16) {
    match inner.inbound.on_pubrel(id) {
        Ok(ReleaseAction::Complete { publish }) => {
            // PUBCOMP goes out before the application sees the message.
            if let Err(err) = inner.send(Packet::PubComp(id)).await {
                warn!("PUBCOMP send failed for id {id}: {err}");
            }
            inner.emit(ClientEvent::MessageReceived(inbound_message(&publish)));
        }
        Ok(ReleaseAction::CompleteDup) => {
            if let Err(err) = inner.send(Packet::PubComp(id)).await {
                warn!("duplicate PUBCOMP send failed for id {id}: {err}");
            }
        }
        Err(err) => {
            error!("inbound PUBREL (id {id}) violated the QoS 2 flow: {err}");
            inner.disconnect_internal().await;
        }
    }
}

/// Timer-driven PINGREQ/PINGRESP probes. Every exit path forces teardown;
/// transport failures are the expected shutdown signal and stay quiet.
async fn keep_alive_loop<T: PacketTransport>(
    inner: Arc<ClientInner<T>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.options.keep_alive_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; the first probe
    // belongs one period after connect.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = ticker.tick() => {
                match inner.send_and_receive(Packet::PingReq, PacketType::PingResp).await {
                    Ok(_) => {}
                    Err(MqttError::CommunicationFailed(_)) => {
                        debug!("keep-alive loop stopping, transport gone");
                        break;
                    }
                    Err(err) => {
                        warn!("keep-alive ping failed: {err}");
                        break;
                    }
                }
            }
        }
    }
    inner.disconnect_internal().await;
}

fn outbound_publish(message: ApplicationMessage, packet_id: Option<u16>) -> PublishPacket {
    PublishPacket {
        topic: message.topic,
        payload: message.payload,
        qos: message.qos,
        packet_id,
        dup: false,
        retain: message.retain,
    }
}

fn inbound_message(publish: &PublishPacket) -> ApplicationMessage {
    ApplicationMessage {
        topic: publish.topic.clone(),
        payload: publish.payload.clone(),
        qos: publish.qos,
        retain: publish.retain,
    }
}
