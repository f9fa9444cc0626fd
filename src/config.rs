//! Client configuration.

use std::time::Duration;

use log::warn;
use rand::{Rng, distributions::Alphanumeric};

use crate::{
    packet::{QoS, connect::Will},
    protocol::ProtocolVersion,
    topic,
};

pub const DEFAULT_PORT: u16 = 1883;
/// Conventional port for MQTT over TLS, for connectors that wrap the stream.
pub const DEFAULT_TLS_PORT: u16 = 8883;

const CLIENT_ID_PREFIX: &str = "mqs_";
const CLIENT_ID_RANDOM_LEN: usize = 16;
/// Longest client identifier an MQTT 3.1 broker has to accept.
const CLIENT_ID_MAX_LEN: usize = 23;

/// Message the broker publishes on our behalf if we vanish without a
/// DISCONNECT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

impl From<LastWill> for Will {
    fn from(will: LastWill) -> Self {
        Will {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Broker host name or address.
    pub host: String,
    pub port: u16,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    /// Client identifier. Left empty, one is generated when the client is
    /// created.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// How long to wait for CONNACK and for every acknowledgment before
    /// resending.
    pub ack_timeout: Duration,
    /// Reconnect on its own after a lost connection.
    pub persistent: bool,
    /// Do not spawn a worker thread; the caller drives `mqtt_loop`.
    pub blocking: bool,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// Give up on an unacknowledged packet after this many resends.
    /// `None` resends forever.
    pub max_retries: Option<u32>,
    /// Pause between two worker loop iterations.
    pub tick: Duration,
    /// Packets read per loop iteration.
    pub max_read: usize,
    /// Packets written per loop iteration.
    pub max_write: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
            client_id: String::new(),
            username: None,
            password: None,
            will: None,
            keep_alive: 60,
            ack_timeout: Duration::from_secs(5),
            persistent: false,
            blocking: false,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(5),
            max_retries: None,
            tick: Duration::from_millis(5),
            max_read: 10,
            max_write: 80,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn reconnect(mut self, attempts: u32, interval: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_interval = interval;
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Per-iteration read and write budgets of the worker loop.
    pub fn loop_budget(mut self, max_read: usize, max_write: usize) -> Self {
        self.max_read = max_read;
        self.max_write = max_write;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), crate::Error> {
        if self.host.is_empty() {
            return Err(crate::Error::Parameter("host must not be empty"));
        }

        if self.port == 0 {
            return Err(crate::Error::Parameter("port must be positive"));
        }

        if let Some(will) = &self.will {
            topic::validate_topic(&will.topic)?;
        }

        if self.password.is_some() && self.username.is_none() {
            return Err(crate::Error::Parameter("password requires a username"));
        }

        Ok(())
    }

    pub(crate) fn ack_timeout_ms(&self) -> u64 {
        u64::try_from(self.ack_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Fills in a generated client id if none was configured.
    pub(crate) fn resolve_client_id(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = generate_client_id().as_str().to_owned();
        } else if self.client_id.len() > CLIENT_ID_MAX_LEN {
            warn!(
                "client id {:?} is longer than {CLIENT_ID_MAX_LEN} bytes, 3.1 brokers may reject it",
                self.client_id
            );
        }
    }
}

fn generate_client_id() -> heapless::String<CLIENT_ID_MAX_LEN> {
    let mut id = heapless::String::new();
    let _ = id.push_str(CLIENT_ID_PREFIX);

    for c in rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_RANDOM_LEN)
    {
        let _ = id.push(char::from(c));
    }

    id
}
