//! Receiver-side QoS flow state.
//!
//! Tracks half-completed QoS 2 deliveries and already-delivered packet ids
//! so broker retransmissions are re-acknowledged without reaching the
//! application twice. The tracker decides; the session controller performs
//! the sends and the delivery in the order mandated here.

use crate::error::{MqttError, Result};
use crate::protocol::{PublishPacket, Qos};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// Delivered-id history cap. The 16-bit id space bounds correctness; this
/// bounds memory within a long session.
const PROCESSED_IDS_WINDOW: usize = 4_096;

/// What the session must do with an inbound PUBLISH.
#[derive(Debug)]
pub(crate) enum PublishAction {
    /// QoS 0: deliver, nothing tracked.
    Deliver,
    /// QoS 1, fresh: deliver first, then send PUBACK.
    DeliverThenAck { id: u16 },
    /// QoS 1, duplicate of a delivered id: re-send PUBACK only.
    AckOnly { id: u16 },
    /// QoS 2: send PUBREC; delivery is deferred until PUBREL.
    Record { id: u16 },
}

/// What the session must do with an inbound PUBREL.
#[derive(Debug)]
pub(crate) enum ReleaseAction {
    /// Send PUBCOMP first, then deliver the released message.
    Complete { publish: PublishPacket },
    /// The flow already completed and PUBCOMP was lost: re-send it only.
    CompleteDup,
}

#[derive(Default)]
struct InboundState {
    pending_qos2: HashMap<u16, PublishPacket>,
    processed: HashSet<u16>,
    processed_order: VecDeque<u16>,
}

impl InboundState {
    fn record_processed(&mut self, id: u16) {
        if self.processed.insert(id) {
            self.processed_order.push_back(id);
        }
        while self.processed.len() > PROCESSED_IDS_WINDOW {
            match self.processed_order.pop_front() {
                Some(oldest) => {
                    self.processed.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn forget_processed(&mut self, id: u16) {
        if self.processed.remove(&id) {
            self.processed_order.retain(|candidate| *candidate != id);
        }
    }
}

/// Inbound QoS tracker shared by the per-packet handler tasks.
#[derive(Default)]
pub(crate) struct InboundQosTracker {
    state: Mutex<InboundState>,
}

impl InboundQosTracker {
    /// Classifies an inbound PUBLISH and updates tracking state.
    ///
    /// A QoS ≥ 1 PUBLISH reusing a delivered id without the DUP flag is a
    /// new message: the broker only reuses an id after observing our ack,
    /// so the stale history entry is dropped first.
    pub fn on_publish(&self, publish: &PublishPacket) -> PublishAction {
        match publish.qos {
            Qos::AtMostOnce => PublishAction::Deliver,
            Qos::AtLeastOnce => {
                // Id presence is the decoder's contract for QoS >= 1.
                let id = publish.packet_id.unwrap_or_default();
                let mut state = self.state.lock();
                if publish.dup && state.processed.contains(&id) {
                    return PublishAction::AckOnly { id };
                }
                state.forget_processed(id);
                state.record_processed(id);
                PublishAction::DeliverThenAck { id }
            }
            Qos::ExactlyOnce => {
                let id = publish.packet_id.unwrap_or_default();
                let mut state = self.state.lock();
                if state.pending_qos2.contains_key(&id) {
                    // PUBREC was lost; answer again, keep the stored copy.
                    return PublishAction::Record { id };
                }
                if publish.dup && state.processed.contains(&id) {
                    return PublishAction::Record { id };
                }
                state.forget_processed(id);
                state.pending_qos2.insert(id, publish.clone());
                PublishAction::Record { id }
            }
        }
    }

    /// Resolves a PUBREL. An id that is neither pending nor in the
    /// delivered history violates the QoS 2 flow and fails the session.
    pub fn on_pubrel(&self, id: u16) -> Result<ReleaseAction> {
        let mut state = self.state.lock();
        if let Some(publish) = state.pending_qos2.remove(&id) {
            state.record_processed(id);
            return Ok(ReleaseAction::Complete { publish });
        }
        if state.processed.contains(&id) {
            return Ok(ReleaseAction::CompleteDup);
        }
        Err(MqttError::ProtocolViolation(format!(
            "PUBREL for unknown packet id {id}"
        )))
    }

    pub fn contains_processed(&self, id: u16) -> bool {
        self.state.lock().processed.contains(&id)
    }

    /// Drops all tracking state; invoked at the start of a connect episode.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending_qos2.clear();
        state.processed.clear();
        state.processed_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(qos: Qos, id: Option<u16>, dup: bool) -> PublishPacket {
        PublishPacket {
            topic: "t".to_string(),
            payload: vec![0xAB],
            qos,
            packet_id: id,
            dup,
            retain: false,
        }
    }

    #[test]
    fn qos0_is_untracked() {
        let tracker = InboundQosTracker::default();
        assert!(matches!(
            tracker.on_publish(&publish(Qos::AtMostOnce, None, false)),
            PublishAction::Deliver
        ));
        assert!(!tracker.contains_processed(0));
    }

    #[test]
    fn qos1_delivers_then_acks_and_records() {
        let tracker = InboundQosTracker::default();
        assert!(matches!(
            tracker.on_publish(&publish(Qos::AtLeastOnce, Some(3), false)),
            PublishAction::DeliverThenAck { id: 3 }
        ));
        assert!(tracker.contains_processed(3));
    }

    #[test]
    fn qos1_dup_of_delivered_id_is_ack_only() {
        let tracker = InboundQosTracker::default();
        tracker.on_publish(&publish(Qos::AtLeastOnce, Some(3), false));
        assert!(matches!(
            tracker.on_publish(&publish(Qos::AtLeastOnce, Some(3), true)),
            PublishAction::AckOnly { id: 3 }
        ));
    }

    #[test]
    fn qos1_fresh_reuse_of_delivered_id_delivers_again() {
        let tracker = InboundQosTracker::default();
        tracker.on_publish(&publish(Qos::AtLeastOnce, Some(3), false));
        assert!(matches!(
            tracker.on_publish(&publish(Qos::AtLeastOnce, Some(3), false)),
            PublishAction::DeliverThenAck { id: 3 }
        ));
    }

    #[test]
    fn qos2_flow_defers_delivery_until_pubrel() {
        let tracker = InboundQosTracker::default();
        assert!(matches!(
            tracker.on_publish(&publish(Qos::ExactlyOnce, Some(7), false)),
            PublishAction::Record { id: 7 }
        ));
        assert!(!tracker.contains_processed(7));

        match tracker.on_pubrel(7).unwrap() {
            ReleaseAction::Complete { publish } => {
                assert_eq!(publish.packet_id, Some(7));
                assert_eq!(publish.payload, vec![0xAB]);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        assert!(tracker.contains_processed(7));
    }

    #[test]
    fn qos2_retransmission_before_pubrel_keeps_single_copy() {
        let tracker = InboundQosTracker::default();
        tracker.on_publish(&publish(Qos::ExactlyOnce, Some(7), false));
        assert!(matches!(
            tracker.on_publish(&publish(Qos::ExactlyOnce, Some(7), true)),
            PublishAction::Record { id: 7 }
        ));
        // Still exactly one deferred delivery.
        assert!(matches!(
            tracker.on_pubrel(7).unwrap(),
            ReleaseAction::Complete { .. }
        ));
        assert!(matches!(
            tracker.on_pubrel(7).unwrap(),
            ReleaseAction::CompleteDup
        ));
    }

    #[test]
    fn pubrel_for_unknown_id_is_a_protocol_violation() {
        let tracker = InboundQosTracker::default();
        assert!(matches!(
            tracker.on_pubrel(40),
            Err(MqttError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn clear_drops_pending_and_history() {
        let tracker = InboundQosTracker::default();
        tracker.on_publish(&publish(Qos::ExactlyOnce, Some(7), false));
        tracker.on_publish(&publish(Qos::AtLeastOnce, Some(8), false));
        tracker.clear();
        assert!(!tracker.contains_processed(8));
        assert!(tracker.on_pubrel(7).is_err());
    }

    #[test]
    fn processed_history_is_bounded() {
        let tracker = InboundQosTracker::default();
        for id in 1..=PROCESSED_IDS_WINDOW as u32 + 10 {
            let id = (id % 65_536) as u16;
            tracker.on_publish(&publish(Qos::AtLeastOnce, Some(id), false));
        }
        let state = tracker.state.lock();
        assert!(state.processed.len() <= PROCESSED_IDS_WINDOW);
        assert_eq!(state.processed.len(), state.processed_order.len());
    }
}
