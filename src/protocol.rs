//! MQTT 3.1.1 control-packet model.
//!
//! Typed packet shapes exchanged with the transport adapter. Byte-level
//! framing (fixed headers, remaining-length encoding) is the adapter's
//! concern; the session engine only ever sees these structures.

use serde::{Deserialize, Serialize};

/// MQTT delivery guarantees: 0 at-most-once, 1 at-least-once, 2 exactly-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_u8(value: u8) -> Option<Qos> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Control-packet discriminator, used as the dispatcher's match key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNACK return codes per MQTT 3.1.1 §3.2.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Option<ConnectReturnCode> {
        match value {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadUserNameOrPassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        }
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

/// Per-filter SUBACK result: granted QoS level or failure (0x80).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    SuccessQos0,
    SuccessQos1,
    SuccessQos2,
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Option<SubscribeReturnCode> {
        match value {
            0x00 => Some(SubscribeReturnCode::SuccessQos0),
            0x01 => Some(SubscribeReturnCode::SuccessQos1),
            0x02 => Some(SubscribeReturnCode::SuccessQos2),
            0x80 => Some(SubscribeReturnCode::Failure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::SuccessQos0 => 0x00,
            SubscribeReturnCode::SuccessQos1 => 0x01,
            SubscribeReturnCode::SuccessQos2 => 0x02,
            SubscribeReturnCode::Failure => 0x80,
        }
    }

    /// The QoS level the broker granted, or `None` on failure.
    pub fn granted_qos(self) -> Option<Qos> {
        match self {
            SubscribeReturnCode::SuccessQos0 => Some(Qos::AtMostOnce),
            SubscribeReturnCode::SuccessQos1 => Some(Qos::AtLeastOnce),
            SubscribeReturnCode::SuccessQos2 => Some(Qos::ExactlyOnce),
            SubscribeReturnCode::Failure => None,
        }
    }
}

/// Will message delivered via CONNECT; the broker publishes it if the
/// session ends ungracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive_seconds: u16,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub user_name: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    /// Present for QoS 1 and 2; zero is never a valid identifier.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

/// One requested subscription: filter plus maximum QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: Qos,
}

/// One granted subscription, paired back with its requested filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGrant {
    pub filter: String,
    pub return_code: SubscribeReturnCode,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
}

#[derive(Debug, Clone)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// An MQTT 3.1.1 control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet identifier, for packets that carry one: PUBLISH at
    /// QoS ≥ 1, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK, and the four
    /// PUBACK/PUBREC/PUBREL/PUBCOMP acknowledgements.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id,
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => Some(*id),
            Packet::Subscribe(subscribe) => Some(subscribe.packet_id),
            Packet::SubAck(suback) => Some(suback.packet_id),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            _ => None,
        }
    }
}
