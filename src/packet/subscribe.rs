use crate::{
    packet::{
        PacketId, QoS,
        decode::{self, DecodePacket},
        encode::{self, Encode, EncodePacket},
    },
    protocol::PacketType,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: PacketId,
    pub topics: Vec<Subscription>,
}

/// Topic filter and the maximum QoS requested or granted for it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

impl<S: Into<String>> From<(S, QoS)> for Subscription {
    fn from((filter, qos): (S, QoS)) -> Self {
        Self::new(filter, qos)
    }
}

impl EncodePacket for Subscribe {
    const PACKET_TYPE: PacketType = PacketType::Subscribe;

    fn required_space(&self) -> usize {
        let mut required = self.packet_id.required_space();

        for topic in &self.topics {
            required += topic.filter.required_space() + topic.qos.required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        if self.topics.is_empty() || self.topics.iter().any(|t| t.filter.is_empty()) {
            return Err(crate::Error::MalformedPacket);
        }

        self.packet_id.encode(cursor)?;

        for topic in &self.topics {
            topic.filter.encode(cursor)?;
            topic.qos.encode(cursor)?;
        }

        Ok(())
    }
}

impl DecodePacket for Subscribe {
    fn decode(cursor: &mut decode::Cursor<'_>, _: u8) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let mut topics = Vec::new();

        while !cursor.is_empty() {
            let filter = cursor.read_utf8()?;
            if filter.is_empty() {
                return Err(crate::Error::MalformedPacket);
            }

            let qos = QoS::decode(cursor)?;
            topics.push(Subscription::new(filter, qos));
        }

        if topics.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(Subscribe { packet_id, topics })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: PacketId,
    pub return_codes: Vec<SubAckReturnCode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckReturnCode {
    Success(QoS),
    Failure,
}

impl SubAckReturnCode {
    const FAILURE: u8 = 0x80;
}

impl TryFrom<u8> for SubAckReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::FAILURE => Ok(Self::Failure),
            0..=2 => QoS::try_from(value).map(Self::Success),
            _ => Err(crate::Error::InvalidSubAckReturnCode(value)),
        }
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(value: SubAckReturnCode) -> Self {
        match value {
            SubAckReturnCode::Success(qos) => qos as u8,
            SubAckReturnCode::Failure => SubAckReturnCode::FAILURE,
        }
    }
}

impl EncodePacket for SubAck {
    const PACKET_TYPE: PacketType = PacketType::SubAck;

    fn required_space(&self) -> usize {
        self.packet_id.required_space() + self.return_codes.len()
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.packet_id.encode(cursor)?;

        for code in &self.return_codes {
            u8::from(*code).encode(cursor)?;
        }

        Ok(())
    }
}

impl DecodePacket for SubAck {
    fn decode(cursor: &mut decode::Cursor<'_>, _: u8) -> Result<Self, crate::Error> {
        let packet_id = PacketId::decode(cursor)?;

        let return_codes = cursor
            .read_rest()
            .iter()
            .map(|byte| SubAckReturnCode::try_from(*byte))
            .collect::<Result<Vec<_>, _>>()?;

        if return_codes.is_empty() {
            return Err(crate::Error::MalformedPacket);
        }

        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}
