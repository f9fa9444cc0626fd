use crate::{
    packet::{
        PacketId, QoS,
        decode::{self, DecodePacket},
        encode::{self, Encode, EncodePacket},
    },
    protocol::PacketType,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    pub flags: Flags,
    pub topic: String,
    /// Present exactly when `flags.qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<PacketId>,
    pub payload: Vec<u8>,
}

impl Publish {
    /// A first transmission; the session assigns the packet id for QoS 1/2.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            flags: Flags {
                dup: false,
                qos,
                retain,
            },
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn qos(&self) -> QoS {
        self.flags.qos
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.topic.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        if self.flags.dup && self.flags.qos == QoS::AtMostOnce {
            return Err(crate::Error::InvalidFlags);
        }

        match (self.flags.qos, self.packet_id) {
            (QoS::AtMostOnce, None) | (QoS::AtLeastOnce | QoS::ExactlyOnce, Some(_)) => Ok(()),
            _ => Err(crate::Error::MalformedPacket),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl TryFrom<u8> for Flags {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let dup = value & 0b1000 != 0;
        let qos = QoS::try_from((value >> 1) & 0b11)?;
        let retain = value & 0b0001 != 0;

        if dup && qos == QoS::AtMostOnce {
            return Err(crate::Error::InvalidFlags);
        }

        Ok(Self { dup, qos, retain })
    }
}

impl From<&Flags> for u8 {
    fn from(value: &Flags) -> Self {
        (value.dup as u8) << 3 | (value.qos as u8) << 1 | (value.retain as u8)
    }
}

impl EncodePacket for Publish {
    const PACKET_TYPE: PacketType = PacketType::Publish;

    fn flags(&self) -> u8 {
        (&self.flags).into()
    }

    fn required_space(&self) -> usize {
        self.topic.required_space()
            + self.packet_id.map(|id| id.required_space()).unwrap_or(0)
            + self.payload.len()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.validate()?;

        self.topic.encode(cursor)?;
        if let Some(id) = self.packet_id {
            id.encode(cursor)?;
        }
        cursor.write_bytes(&self.payload)
    }
}

impl DecodePacket for Publish {
    fn decode(cursor: &mut decode::Cursor<'_>, flags: u8) -> Result<Self, crate::Error> {
        let flags = Flags::try_from(flags)?;

        let topic = cursor.read_utf8()?;
        if topic.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        let packet_id = match flags.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(PacketId::decode(cursor)?),
        };

        Ok(Publish {
            flags,
            topic: topic.to_owned(),
            packet_id,
            payload: cursor.read_rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos0_without_packet_id() {
        let body = [
            0x00, 0x05, b't', b'o', b'p', b'i', b'c', b'p', b'a', b'y', b'l', b'o', b'a', b'd',
        ];
        let mut cursor = decode::Cursor::new(&body);
        let packet = Publish::decode(&mut cursor, 0b0000_0001).unwrap();

        assert_eq!(
            packet.flags,
            Flags {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: true
            }
        );
        assert_eq!(packet.packet_id, None);
        assert_eq!(packet.topic, "topic");
        assert_eq!(packet.payload, b"payload");
    }

    #[test]
    fn qos2_reads_packet_id_and_empty_payload() {
        let body = [0x00, 0x01, b't', 0x12, 0x34];
        let mut cursor = decode::Cursor::new(&body);
        let packet = Publish::decode(&mut cursor, 0b0000_1100).unwrap();

        assert!(packet.flags.dup);
        assert_eq!(packet.qos(), QoS::ExactlyOnce);
        assert_eq!(packet.packet_id.map(|id| id.get()), Some(0x1234));
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn invalid_flag_combinations() {
        assert!(matches!(Flags::try_from(0b0110), Err(crate::Error::InvalidQoS)));
        assert!(matches!(Flags::try_from(0b1000), Err(crate::Error::InvalidFlags)));
    }

    #[test]
    fn empty_topic_is_malformed() {
        let body = [0x00, 0x00, b'x'];
        let mut cursor = decode::Cursor::new(&body);
        assert!(matches!(
            Publish::decode(&mut cursor, 0),
            Err(crate::Error::MalformedPacket)
        ));

        let publish = Publish::new("", b"x".to_vec(), QoS::AtMostOnce, false);
        assert!(matches!(
            encode::encode_packet(&publish),
            Err(crate::Error::MalformedPacket)
        ));
    }

    #[test]
    fn qos1_requires_packet_id_to_encode() {
        let publish = Publish::new("t", b"x".to_vec(), QoS::AtLeastOnce, false);
        assert!(encode::encode_packet(&publish).is_err());
    }

    #[test]
    fn dup_on_qos0_is_refused_on_encode() {
        let mut publish = Publish::new("tx", Vec::new(), QoS::AtMostOnce, false);
        publish.flags.dup = true;

        assert!(matches!(
            encode::encode_packet(&publish),
            Err(crate::Error::InvalidFlags)
        ));
    }

    #[test]
    fn wire_layout() {
        let mut publish = Publish::new("a/b", b"hi".to_vec(), QoS::AtLeastOnce, true);
        publish.packet_id = PacketId::new(10);

        let bytes = encode::encode_packet(&publish).unwrap();
        assert_eq!(
            bytes,
            [0x33, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
        );
    }
}
