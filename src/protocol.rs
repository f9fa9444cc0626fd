use core::{fmt, str::FromStr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Flag nibble mandated for every type except PUBLISH.
    pub(crate) fn fixed_flags(&self) -> u8 {
        match self {
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => 0b0010,
            _ => 0,
        }
    }

    pub(crate) fn validate_flags(&self, flags: u8) -> bool {
        match self {
            Self::Publish => true,
            _ => flags == self.fixed_flags(),
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            // SAFETY: `PacketType` is `repr(u8)` with contiguous discriminants 1..=14.
            1..=14 => Ok(unsafe { core::mem::transmute::<u8, PacketType>(value) }),
            _ => Err(crate::Error::InvalidPacketType),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_len: usize,
}

/// Largest value the variable-length remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// MQTT protocol revision announced in CONNECT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`, level 3.
    V31,
    /// MQTT 3.1.1, protocol name `MQTT`, level 4.
    #[default]
    V311,
}

impl ProtocolVersion {
    pub fn protocol_name(&self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }

    pub(crate) fn from_wire(name: &str, level: u8) -> Result<Self, crate::Error> {
        match (name, level) {
            ("MQIsdp", 3) => Ok(Self::V31),
            ("MQTT", 4) => Ok(Self::V311),
            _ => Err(crate::Error::UnsupportedProtocol),
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3.1" => Ok(Self::V31),
            "3.1.1" => Ok(Self::V311),
            _ => Err(crate::Error::Parameter("protocol version must be \"3.1\" or \"3.1.1\"")),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V31 => f.write_str("3.1"),
            Self::V311 => f.write_str("3.1.1"),
        }
    }
}

/// Lifecycle of the broker connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK on the connecting thread.
    New,
    /// CONNECT sent, CONNACK will be picked up by the background loop.
    ConnectAsync,
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self, Self::New | Self::ConnectAsync)
    }
}
