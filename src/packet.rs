//! MQTT control packets and their wire encoding.
//!
//! The codec is stateless: [`Packet::encode`] turns a packet into the bytes of
//! one complete control packet and [`Packet::decode`] parses a body once the
//! fixed header has been read. [`Packet::from_bytes`] does both framing steps
//! over an in-memory buffer.

use core::fmt;

use crate::{
    packet::{
        connect::{ConnAck, Connect},
        decode::DecodePacket,
        encode::{Encode, EncodePacket},
        publish::Publish,
        subscribe::{SubAck, Subscribe},
        unsubscribe::Unsubscribe,
    },
    protocol::{FixedHeader, PacketType},
};

pub mod connect;
pub(crate) mod decode;
pub(crate) mod encode;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(PacketId),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect => PacketType::Disconnect,
        }
    }

    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            Self::Publish(publish) => publish.packet_id,
            Self::PubAck(id)
            | Self::PubRec(id)
            | Self::PubRel(id)
            | Self::PubComp(id)
            | Self::UnsubAck(id) => Some(*id),
            Self::Subscribe(subscribe) => Some(subscribe.packet_id),
            Self::SubAck(suback) => Some(suback.packet_id),
            Self::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            _ => None,
        }
    }

    /// Marks a retransmission. Only PUBLISH carries a DUP bit.
    pub(crate) fn set_dup(&mut self) {
        if let Self::Publish(publish) = self {
            if publish.flags.qos != QoS::AtMostOnce {
                publish.flags.dup = true;
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, crate::Error> {
        match self {
            Self::Connect(packet) => encode::encode_packet(packet),
            Self::ConnAck(packet) => encode::encode_packet(packet),
            Self::Publish(packet) => encode::encode_packet(packet),
            Self::PubAck(id) => encode::encode_packet(&OnlyPacketId::<4>(*id)),
            Self::PubRec(id) => encode::encode_packet(&OnlyPacketId::<5>(*id)),
            Self::PubRel(id) => encode::encode_packet(&OnlyPacketId::<6>(*id)),
            Self::PubComp(id) => encode::encode_packet(&OnlyPacketId::<7>(*id)),
            Self::Subscribe(packet) => encode::encode_packet(packet),
            Self::SubAck(packet) => encode::encode_packet(packet),
            Self::Unsubscribe(packet) => encode::encode_packet(packet),
            Self::UnsubAck(id) => encode::encode_packet(&OnlyPacketId::<11>(*id)),
            Self::PingReq => Ok(empty_body(PacketType::PingReq)),
            Self::PingResp => Ok(empty_body(PacketType::PingResp)),
            Self::Disconnect => Ok(empty_body(PacketType::Disconnect)),
        }
    }

    /// Parses a packet body whose fixed header has already been read.
    ///
    /// The body must be exactly `header.remaining_len` bytes long and must be
    /// consumed entirely by the type-specific parser.
    pub fn decode(header: &FixedHeader, body: &[u8]) -> Result<Self, crate::Error> {
        if header.remaining_len != body.len() {
            return Err(crate::Error::MalformedRemainingLength);
        }

        if !header.packet_type.validate_flags(header.flags) {
            return Err(crate::Error::InvalidFlags);
        }

        let cursor = &mut decode::Cursor::new(body);
        let flags = header.flags;

        let packet = match header.packet_type {
            PacketType::Connect => Connect::decode(cursor, flags).map(Packet::Connect),
            PacketType::ConnAck => ConnAck::decode(cursor, flags).map(Packet::ConnAck),
            PacketType::Publish => Publish::decode(cursor, flags).map(Packet::Publish),
            PacketType::PubAck => only_packet_id(cursor).map(Packet::PubAck),
            PacketType::PubRec => only_packet_id(cursor).map(Packet::PubRec),
            PacketType::PubRel => only_packet_id(cursor).map(Packet::PubRel),
            PacketType::PubComp => only_packet_id(cursor).map(Packet::PubComp),
            PacketType::Subscribe => Subscribe::decode(cursor, flags).map(Packet::Subscribe),
            PacketType::SubAck => SubAck::decode(cursor, flags).map(Packet::SubAck),
            PacketType::Unsubscribe => {
                Unsubscribe::decode(cursor, flags).map(Packet::Unsubscribe)
            }
            PacketType::UnsubAck => only_packet_id(cursor).map(Packet::UnsubAck),
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
        }?;

        cursor.expect_empty()?;

        Ok(packet)
    }

    /// Decodes the first complete packet in `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied. An incomplete
    /// packet yields [`crate::Error::UnexpectedEof`].
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), crate::Error> {
        let mut reader = buf;
        let header = crate::parser::read_fixed_header(&mut reader).map_err(|err| match err {
            crate::Error::ConnectionClosed => crate::Error::UnexpectedEof,
            err => err,
        })?;
        let header_len = buf.len() - reader.len();
        let end = header_len
            .checked_add(header.remaining_len)
            .ok_or(crate::Error::MalformedRemainingLength)?;

        if buf.len() < end {
            return Err(crate::Error::UnexpectedEof);
        }

        let packet = Self::decode(&header, &buf[header_len..end])?;

        Ok((packet, end))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.packet_id() {
            Some(id) => write!(f, "{:?}({})", self.packet_type(), id),
            None => write!(f, "{:?}", self.packet_type()),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        let byte = cursor.read_u8()?;
        Self::try_from(byte)
    }
}

impl TryFrom<u8> for QoS {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let qos = match value {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            2 => Self::ExactlyOnce,
            _ => return Err(crate::Error::InvalidQoS),
        };

        Ok(qos)
    }
}

impl Encode for QoS {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (*self as u8).encode(cursor)
    }

    fn required_space(&self) -> usize {
        1
    }
}

/// Non-zero 16-bit packet identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketId(u16);

impl PacketId {
    pub fn new(id: u16) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    fn decode(cursor: &mut decode::Cursor) -> Result<Self, crate::Error> {
        Self::try_from(cursor.read_u16()?)
    }
}

impl TryFrom<u16> for PacketId {
    type Error = crate::Error;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Self::new(id).ok_or(crate::Error::MalformedPacket)
    }
}

impl From<PacketId> for u16 {
    fn from(id: PacketId) -> Self {
        id.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Encode for PacketId {
    fn encode(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.0.encode(cursor)
    }

    fn required_space(&self) -> usize {
        2
    }
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share a body made of the
/// packet identifier alone; `T` is the packet type nibble.
struct OnlyPacketId<const T: u8>(PacketId);

impl<const T: u8> EncodePacket for OnlyPacketId<T> {
    const PACKET_TYPE: PacketType = match T {
        4 => PacketType::PubAck,
        5 => PacketType::PubRec,
        6 => PacketType::PubRel,
        7 => PacketType::PubComp,
        _ => PacketType::UnsubAck,
    };

    fn required_space(&self) -> usize {
        self.0.required_space()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.0.encode(cursor)
    }
}

fn only_packet_id(cursor: &mut decode::Cursor<'_>) -> Result<PacketId, crate::Error> {
    PacketId::decode(cursor)
}

fn empty_body(packet_type: PacketType) -> Vec<u8> {
    vec![(packet_type as u8) << 4, 0]
}
