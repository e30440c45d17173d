//! Inbound packet correlation.
//!
//! Callers that sent a request register a typed waiter keyed by the
//! expected response type and, for identifier-bearing exchanges, the
//! request's packet id. The receive loop offers every packet it does not
//! handle inline; the first matching waiter wins.

use crate::protocol::{Packet, PacketType};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    token: u64,
    packet_type: PacketType,
    packet_id: Option<u16>,
    tx: oneshot::Sender<Packet>,
}

impl Waiter {
    fn matches(&self, packet: &Packet) -> bool {
        if self.packet_type != packet.packet_type() {
            return false;
        }
        match self.packet_id {
            Some(id) => packet.packet_id() == Some(id),
            None => true,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_token: u64,
    waiters: Vec<Waiter>,
}

/// Single-shot response handle returned by [`PacketDispatcher::register`].
pub(crate) struct PendingResponse {
    token: u64,
    rx: oneshot::Receiver<Packet>,
}

impl PendingResponse {
    /// Token for removing the waiter after a timeout.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Resolves with the matched packet, or errors once the dispatcher is
    /// reset and the sending half is dropped.
    pub async fn recv(self) -> Result<Packet, oneshot::error::RecvError> {
        self.rx.await
    }
}

/// Correlates asynchronously arriving broker packets with waiting callers.
#[derive(Default)]
pub(crate) struct PacketDispatcher {
    registry: Mutex<Registry>,
}

impl PacketDispatcher {
    /// Registers a waiter for the next packet of `packet_type` whose id
    /// equals `packet_id` (when given). Waiters are matched in
    /// registration order.
    pub fn register(&self, packet_type: PacketType, packet_id: Option<u16>) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let mut registry = self.registry.lock();
        registry.next_token += 1;
        let token = registry.next_token;
        registry.waiters.push(Waiter {
            token,
            packet_type,
            packet_id,
            tx,
        });
        PendingResponse { token, rx }
    }

    /// Completes the first matching waiter with `packet`. Packets matching
    /// no waiter are dropped: stray acks have no recipient and that is
    /// protocol-legal.
    pub fn dispatch(&self, packet: Packet) {
        let waiter = {
            let mut registry = self.registry.lock();
            let position = registry
                .waiters
                .iter()
                .position(|waiter| waiter.matches(&packet));
            position.map(|index| registry.waiters.remove(index))
        };
        match waiter {
            // The receiver may have timed out concurrently; nothing to do.
            Some(waiter) => {
                let _ = waiter.tx.send(packet);
            }
            None => debug!(
                "dropping unmatched inbound {:?} packet",
                packet.packet_type()
            ),
        }
    }

    /// Unregisters a waiter that stopped waiting (timeout path).
    pub fn remove(&self, token: u64) {
        self.registry
            .lock()
            .waiters
            .retain(|waiter| waiter.token != token);
    }

    /// Cancels all outstanding waiters and clears the registry. Dropped
    /// senders make every pending `recv` resolve with an error.
    pub fn reset(&self) {
        let drained = std::mem::take(&mut self.registry.lock().waiters);
        if !drained.is_empty() {
            debug!("canceling {} outstanding waiters", drained.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_completes_waiter_with_matching_id() {
        let dispatcher = PacketDispatcher::default();
        let pending = dispatcher.register(PacketType::PubAck, Some(4));
        dispatcher.dispatch(Packet::PubAck(4));
        let packet = pending.recv().await.unwrap();
        assert!(matches!(packet, Packet::PubAck(4)));
    }

    #[tokio::test]
    async fn dispatch_ignores_waiter_with_other_id() {
        let dispatcher = PacketDispatcher::default();
        let pending = dispatcher.register(PacketType::PubAck, Some(1));
        dispatcher.dispatch(Packet::PubAck(2));
        // The waiter must still be pending; resetting surfaces that.
        dispatcher.reset();
        assert!(pending.recv().await.is_err());
    }

    #[tokio::test]
    async fn first_registered_waiter_wins() {
        let dispatcher = PacketDispatcher::default();
        let first = dispatcher.register(PacketType::PingResp, None);
        let second = dispatcher.register(PacketType::PingResp, None);
        dispatcher.dispatch(Packet::PingResp);
        assert!(matches!(first.recv().await, Ok(Packet::PingResp)));
        dispatcher.dispatch(Packet::PingResp);
        assert!(matches!(second.recv().await, Ok(Packet::PingResp)));
    }

    #[tokio::test]
    async fn reset_cancels_outstanding_waiters() {
        let dispatcher = PacketDispatcher::default();
        let pending = dispatcher.register(PacketType::SubAck, Some(3));
        dispatcher.reset();
        assert!(pending.recv().await.is_err());
    }

    #[test]
    fn dispatch_without_waiters_is_a_no_op() {
        let dispatcher = PacketDispatcher::default();
        dispatcher.dispatch(Packet::PubComp(9));
        assert!(dispatcher.registry.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn removed_waiter_no_longer_matches() {
        let dispatcher = PacketDispatcher::default();
        let first = dispatcher.register(PacketType::PubRec, Some(5));
        let second = dispatcher.register(PacketType::PubRec, Some(5));
        dispatcher.remove(first.token());
        dispatcher.dispatch(Packet::PubRec(5));
        assert!(matches!(second.recv().await, Ok(Packet::PubRec(5))));
    }
}
