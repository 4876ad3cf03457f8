//! Packet model for the push wire protocol.
//!
//! One variant per frame type the client speaks. Encoding and decoding live in
//! [`crate::codec`]; this module only describes the frames.

use bytes::Bytes;

use crate::header::{ConnectFlags, PacketType};
use crate::WireError;

/// Protocol name sent in every connect frame
pub const PROTOCOL_NAME: &str = "MQTToT";

/// Protocol level sent in every connect frame
pub const PROTOCOL_LEVEL: u8 = 3;

/// Quality-of-service level of a publish
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityOfService {
    /// Fire and forget, no packet id
    AtMostOnce = 0,
    /// Acknowledged with a PubAck carrying the packet id
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QualityOfService {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QualityOfService::AtMostOnce),
            1 => Ok(QualityOfService::AtLeastOnce),
            _ => Err(WireError::InvalidQos(value)),
        }
    }
}

/// Return code of a connect acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted,
    /// Protocol level not supported by the broker
    UnacceptableProtocolVersion,
    /// Client identifier rejected
    IdentifierRejected,
    /// Broker unavailable
    ServerUnavailable,
    /// Credentials rejected
    BadUsernameOrPassword,
    /// Client not authorised
    NotAuthorized,
    /// Code outside the known set
    Other(u8),
}

impl ConnectReturnCode {
    /// Wire value of the code
    pub fn code(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(code) => code,
        }
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Other(other),
        }
    }
}

/// Broker topics, carried on the wire as a one-byte id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushTopic {
    /// Push notification delivery
    Message,
    /// Client-to-broker registration request
    RegistrationRequest,
    /// Broker-to-client registration response carrying the token
    RegistrationResponse,
    /// Any other topic id
    Other(u8),
}

impl PushTopic {
    /// Wire id of the topic
    pub fn id(self) -> u8 {
        match self {
            PushTopic::Message => 76,
            PushTopic::RegistrationRequest => 15,
            PushTopic::RegistrationResponse => 16,
            PushTopic::Other(id) => id,
        }
    }
}

impl From<u8> for PushTopic {
    fn from(id: u8) -> Self {
        match id {
            76 => PushTopic::Message,
            15 => PushTopic::RegistrationRequest,
            16 => PushTopic::RegistrationResponse,
            other => PushTopic::Other(other),
        }
    }
}

/// Connect frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    /// Protocol name
    pub protocol_name: String,
    /// Protocol level
    pub protocol_level: u8,
    /// Connect flags
    pub flags: ConnectFlags,
    /// Keep-alive interval in seconds negotiated with the broker
    pub keep_alive_secs: u16,
    /// Deflated JSON describing device and auth context
    pub payload: Bytes,
}

impl ConnectPacket {
    /// Connect frame with the protocol defaults and the given payload
    pub fn new(keep_alive_secs: u16, payload: Bytes) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            flags: ConnectFlags::USERNAME | ConnectFlags::PASSWORD | ConnectFlags::CLEAN_SESSION,
            keep_alive_secs,
            payload,
        }
    }
}

/// Connect acknowledgment frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    /// Acknowledge flags byte
    pub ack_flags: u8,
    /// Return code
    pub return_code: ConnectReturnCode,
    /// Authentication JSON issued by the broker, if any
    pub authentication: Option<String>,
}

/// Publish frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    /// Topic
    pub topic: PushTopic,
    /// Quality of service
    pub qos: QualityOfService,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Retain flag
    pub retain: bool,
    /// Packet id, present only when `qos` requires acknowledgment
    pub packet_id: Option<u16>,
    /// Payload bytes, inflated when the broker sent them deflated
    pub payload: Bytes,
}

impl PublishPacket {
    /// Build a publish; a packet id is kept only for acknowledged QoS
    pub fn new(topic: PushTopic, qos: QualityOfService, packet_id: u16, payload: Bytes) -> Self {
        Self {
            topic,
            qos,
            dup: false,
            retain: false,
            packet_id: match qos {
                QualityOfService::AtMostOnce => None,
                QualityOfService::AtLeastOnce => Some(packet_id),
            },
            payload,
        }
    }
}

/// Publish acknowledgment frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAckPacket {
    /// Packet id being acknowledged
    pub packet_id: u16,
}

impl PubAckPacket {
    /// Acknowledgment for `publish`; fails when it carries no packet id
    pub fn in_response_to(publish: &PublishPacket) -> Result<Self, WireError> {
        publish
            .packet_id
            .map(|packet_id| Self { packet_id })
            .ok_or(WireError::MissingPacketId)
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connect
    Connect(ConnectPacket),
    /// Connect acknowledgment
    ConnAck(ConnAckPacket),
    /// Publish
    Publish(PublishPacket),
    /// Publish acknowledgment
    PubAck(PubAckPacket),
    /// Ping request
    PingReq,
    /// Ping response
    PingResp,
}

impl Packet {
    /// Type tag of the frame
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_puback_in_response_to() {
        let publish = PublishPacket::new(
            PushTopic::Message,
            QualityOfService::AtLeastOnce,
            0xBEEF,
            Bytes::from_static(b"{}"),
        );
        let ack = PubAckPacket::in_response_to(&publish).unwrap();
        assert_eq!(ack.packet_id, 0xBEEF);
    }

    #[test]
    fn test_puback_requires_packet_id() {
        let publish = PublishPacket::new(
            PushTopic::Message,
            QualityOfService::AtMostOnce,
            7,
            Bytes::new(),
        );
        assert_eq!(publish.packet_id, None);
        assert!(matches!(
            PubAckPacket::in_response_to(&publish),
            Err(WireError::MissingPacketId)
        ));
    }

    #[test]
    fn test_topic_ids() {
        for topic in [
            PushTopic::Message,
            PushTopic::RegistrationRequest,
            PushTopic::RegistrationResponse,
            PushTopic::Other(231),
        ] {
            assert_eq!(PushTopic::from(topic.id()), topic);
        }
    }

    #[test]
    fn test_return_codes() {
        assert_eq!(ConnectReturnCode::from(0), ConnectReturnCode::Accepted);
        assert_eq!(ConnectReturnCode::from(5), ConnectReturnCode::NotAuthorized);
        assert_eq!(ConnectReturnCode::from(42).code(), 42);
        assert!(QualityOfService::try_from(2).is_err());
    }

    #[test]
    fn test_connect_defaults() {
        let connect = ConnectPacket::new(900, Bytes::new());
        assert_eq!(connect.protocol_name, PROTOCOL_NAME);
        assert_eq!(connect.protocol_level, 3);
        assert_eq!(connect.flags.bits(), 0xC2);
    }
}
