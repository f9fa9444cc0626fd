use crate::{
    packet::{
        QoS,
        decode::{self, DecodePacket},
        encode::{self, Encode, EncodePacket},
    },
    protocol::{PacketType, ProtocolVersion},
};

const USERNAME: u8 = 0b1000_0000;
const PASSWORD: u8 = 0b0100_0000;
const WILL_RETAIN: u8 = 0b0010_0000;
const WILL_FLAG: u8 = 0b0000_0100;
const CLEAN_SESSION: u8 = 0b0000_0010;
const RESERVED: u8 = 0b0000_0001;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Connect {
    fn connect_flags(&self) -> u8 {
        let mut flags = 0;

        if self.username.is_some() {
            flags |= USERNAME;
        }

        if self.password.is_some() {
            flags |= PASSWORD;
        }

        if let Some(will) = &self.will {
            flags |= WILL_FLAG | (will.qos as u8) << 3;

            if will.retain {
                flags |= WILL_RETAIN;
            }
        }

        if self.clean_session {
            flags |= CLEAN_SESSION;
        }

        flags
    }
}

impl DecodePacket for Connect {
    fn decode(cursor: &mut decode::Cursor<'_>, _: u8) -> Result<Self, crate::Error> {
        let protocol_name = cursor.read_utf8()?;
        let level = cursor.read_u8()?;
        let version = ProtocolVersion::from_wire(protocol_name, level)?;

        let flags = cursor.read_u8()?;
        if flags & RESERVED != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let will_flag = flags & WILL_FLAG != 0;
        let will_qos = QoS::try_from((flags >> 3) & 0b11)?;
        let will_retain = flags & WILL_RETAIN != 0;

        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(crate::Error::MalformedPacket);
        }

        let keep_alive = cursor.read_u16()?;
        let client_id = cursor.read_utf8()?.to_owned();

        let will = if will_flag {
            Some(Will {
                topic: cursor.read_utf8()?.to_owned(),
                payload: cursor.read_binary_chunk()?.to_vec(),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if flags & USERNAME != 0 {
            Some(cursor.read_utf8()?.to_owned())
        } else {
            None
        };

        let password = if flags & PASSWORD != 0 {
            Some(cursor.read_binary_chunk()?.to_vec())
        } else {
            None
        };

        Ok(Connect {
            version,
            clean_session: flags & CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }
}

impl EncodePacket for Connect {
    const PACKET_TYPE: PacketType = PacketType::Connect;

    fn required_space(&self) -> usize {
        let mut required = self.version.protocol_name().required_space()
            + self.version.level().required_space()
            + self.connect_flags().required_space()
            + self.keep_alive.required_space()
            + self.client_id.required_space();

        if let Some(will) = &self.will {
            required += will.topic.required_space();
            required += will.payload.required_space();
        }

        if let Some(username) = &self.username {
            required += username.required_space();
        }

        if let Some(password) = &self.password {
            required += password.required_space();
        }

        required
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        self.version.protocol_name().encode(cursor)?;
        self.version.level().encode(cursor)?;
        self.connect_flags().encode(cursor)?;
        self.keep_alive.encode(cursor)?;
        self.client_id.encode(cursor)?;

        if let Some(will) = &self.will {
            will.topic.encode(cursor)?;
            will.payload.encode(cursor)?;
        }

        if let Some(username) = &self.username {
            username.encode(cursor)?;
        }

        if let Some(password) = &self.password {
            password.encode(cursor)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl DecodePacket for ConnAck {
    fn decode(cursor: &mut decode::Cursor<'_>, _: u8) -> Result<Self, crate::Error> {
        let flags = cursor.read_u8()?;

        if flags & 0b1111_1110 != 0 {
            return Err(crate::Error::MalformedPacket);
        }

        let return_code = ConnectReturnCode::try_from(cursor.read_u8()?)?;

        Ok(ConnAck {
            session_present: flags & 0b0000_0001 != 0,
            return_code,
        })
    }
}

impl EncodePacket for ConnAck {
    const PACKET_TYPE: PacketType = PacketType::ConnAck;

    fn required_space(&self) -> usize {
        2
    }

    fn encode_body(&self, cursor: &mut encode::Cursor) -> Result<(), crate::Error> {
        (self.session_present as u8).encode(cursor)?;
        (self.return_code as u8).encode(cursor)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => return Err(crate::Error::InvalidConnectReturnCode(value)),
        };

        Ok(code)
    }
}
