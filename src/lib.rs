//! MQTT 3.1 / 3.1.1 client engine.
//!
//! The crate encodes and decodes MQTT control packets, keeps the QoS 1/2
//! handshake state for every in-flight packet identifier and drives a broker
//! session (keep-alive, acknowledgment retransmission, reconnection) from a
//! background worker thread or from a caller-driven loop.
//!
//! ```no_run
//! use mqtt_session::{Client, ClientConfig, QoS, TcpConnector};
//!
//! # fn main() -> Result<(), mqtt_session::Error> {
//! let config = ClientConfig::new("localhost").keep_alive(10);
//! let client: Client<TcpConnector> = Client::new(TcpConnector::default(), config);
//!
//! client.on_message(|publish| {
//!     println!("{}: {:?}", publish.topic, publish.payload);
//! });
//!
//! client.connect()?;
//! client.subscribe(&[("sensors/#", QoS::AtLeastOnce)])?;
//! client.publish("sensors/temp", b"21.5", false, QoS::ExactlyOnce)?;
//! client.disconnect(true)?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod callback;
pub mod client;
pub mod config;
pub(crate) mod handler;
pub(crate) mod inflight;
pub(crate) mod keep_alive;
pub mod packet;
pub(crate) mod packet_id_pool;
pub mod parser;
pub mod protocol;
pub(crate) mod publisher;
pub(crate) mod sender;
pub(crate) mod session;
pub(crate) mod subscriber;
pub mod time;
pub mod topic;
pub mod transport;

pub use client::{Client, InflightCounts};
pub use config::{ClientConfig, DEFAULT_PORT, DEFAULT_TLS_PORT, LastWill};
pub use packet::{
    Packet, PacketId, QoS,
    connect::{ConnAck, ConnectReturnCode},
    publish::Publish,
    subscribe::Subscription,
};
pub use protocol::{ConnectionState, ProtocolVersion};
pub use time::{ManualClock, SessionClock, StdClock};
pub use transport::{Connector, TcpConnector, TcpTransport, Transport};

/// Queue or waiting set that refused a new entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Queue {
    Control,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    SubAck,
    UnsubAck,
}

/// Coarse classification of [`Error`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid caller input.
    Parameter,
    /// Request that the protocol does not allow (e.g. an empty subscribe list).
    ProtocolViolation,
    /// Malformed wire data or an acknowledgment nobody waits for.
    Packet,
    /// The stream is absent or rejected a write.
    WriteFailure,
    /// A bounded queue reached its ceiling.
    QueueFull,
    /// The broker refused, timed out or closed the connection.
    Connection,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid fixed header flags")]
    InvalidFlags,
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    #[error("invalid packet type")]
    InvalidPacketType,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("invalid CONNACK return code {0:#04x}")]
    InvalidConnectReturnCode(u8),
    #[error("invalid SUBACK return code {0:#04x}")]
    InvalidSubAckReturnCode(u8),
    #[error("invalid QoS value")]
    InvalidQoS,
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("unsupported protocol name or level")]
    UnsupportedProtocol,
    #[error("packet ended before its declared length")]
    UnexpectedEof,
    #[error("packet body exceeds the remaining length limit")]
    PacketTooLarge,
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(protocol::PacketType),
    #[error("no request is waiting for packet id {0}")]
    UnknownPacketId(u16),
    #[error("no packet identifier available")]
    NoPacketIdAvailable,
    #[error("invalid parameter: {0}")]
    Parameter(&'static str),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("stream is unavailable for writing")]
    WriteFailure,
    #[error("{0:?} queue is full")]
    QueueFull(Queue),
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error("no CONNACK received within the acknowledgment timeout")]
    ConnackTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("keep-alive expired without traffic from the broker")]
    KeepAliveTimeout,
    #[error("not connected")]
    NotConnected,
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parameter(_) => ErrorKind::Parameter,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::WriteFailure => ErrorKind::WriteFailure,
            Self::QueueFull(_) | Self::NoPacketIdAvailable => ErrorKind::QueueFull,
            Self::ConnectionRefused(_)
            | Self::ConnackTimeout
            | Self::ConnectionClosed
            | Self::KeepAliveTimeout
            | Self::NotConnected
            | Self::ReconnectExhausted { .. }
            | Self::Io(_) => ErrorKind::Connection,
            Self::InvalidFlags
            | Self::MalformedRemainingLength
            | Self::InvalidPacketType
            | Self::MalformedPacket
            | Self::InvalidConnectReturnCode(_)
            | Self::InvalidSubAckReturnCode(_)
            | Self::InvalidQoS
            | Self::InvalidUtf8
            | Self::UnsupportedProtocol
            | Self::UnexpectedEof
            | Self::PacketTooLarge
            | Self::UnexpectedPacket(_)
            | Self::UnknownPacketId(_) => ErrorKind::Packet,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
