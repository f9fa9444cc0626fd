//! In-memory broker for driving a client without sockets.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use mqtt_session::{
    Client, ClientConfig, ConnAck, ConnectReturnCode, Connector, ManualClock, Packet, PacketId,
    QoS,
    packet::subscribe::{SubAck, SubAckReturnCode},
    topic,
};
use parking_lot::Mutex;

pub type TestClient<const N: usize = 20, const Q: usize = 64> =
    Client<MemoryConnector, ManualClock, N, Q>;

struct State {
    to_client: VecDeque<u8>,
    from_client: Vec<u8>,
    received: Vec<Packet>,
    closed: bool,
    offline: bool,
    connections: usize,
    connect_attempts: usize,
    connect_delay: Duration,
    open_streams: usize,
    refusals: VecDeque<ConnectReturnCode>,
    session_present: bool,
    answer_connect: bool,
    answer_pings: bool,
    ack_publishes: bool,
    complete_pubrel: bool,
    suback_codes: Option<Vec<SubAckReturnCode>>,
    subscriptions: Vec<String>,
    next_id: u16,
}

impl State {
    fn push(&mut self, packet: &Packet) {
        let bytes = packet.encode().expect("broker packet encodes");
        self.to_client.extend(bytes);
    }

    fn next_id(&mut self) -> PacketId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        PacketId::new(self.next_id).expect("non-zero id")
    }

    fn respond(&mut self, packet: &Packet) {
        match packet {
            Packet::Connect(_) => {
                if !self.answer_connect {
                    return;
                }

                let return_code = self.refusals.pop_front().unwrap_or(ConnectReturnCode::Accepted);
                let session_present =
                    self.session_present && return_code == ConnectReturnCode::Accepted;

                self.push(&Packet::ConnAck(ConnAck {
                    session_present,
                    return_code,
                }));
            }
            Packet::Subscribe(subscribe) => {
                let return_codes = match self.suback_codes.take() {
                    Some(codes) => codes,
                    None => subscribe
                        .topics
                        .iter()
                        .map(|requested| SubAckReturnCode::Success(requested.qos))
                        .collect(),
                };

                for (requested, code) in subscribe.topics.iter().zip(&return_codes) {
                    if matches!(code, SubAckReturnCode::Success(_)) {
                        self.subscriptions.push(requested.filter.clone());
                    }
                }

                self.push(&Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes,
                }));
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.subscriptions
                    .retain(|filter| !unsubscribe.topics.contains(filter));
                self.push(&Packet::UnsubAck(unsubscribe.packet_id));
            }
            Packet::Publish(publish) => {
                if !self.ack_publishes {
                    return;
                }

                match (publish.qos(), publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => self.push(&Packet::PubAck(id)),
                    (QoS::ExactlyOnce, Some(id)) => self.push(&Packet::PubRec(id)),
                    _ => {}
                }

                let routed = self
                    .subscriptions
                    .iter()
                    .any(|filter| topic::matches(&publish.topic, filter));

                if routed && !publish.flags.dup {
                    let mut forward = publish.clone();
                    forward.flags.retain = false;
                    forward.packet_id = match forward.qos() {
                        QoS::AtMostOnce => None,
                        _ => Some(self.next_id()),
                    };
                    self.push(&Packet::Publish(forward));
                }
            }
            Packet::PubRec(id) => self.push(&Packet::PubRel(*id)),
            Packet::PubRel(id) => {
                if self.complete_pubrel {
                    self.push(&Packet::PubComp(*id));
                }
            }
            Packet::PingReq => {
                if self.answer_pings {
                    self.push(&Packet::PingResp);
                }
            }
            _ => {}
        }
    }
}

/// Scripted broker. Clones share state.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<State>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                to_client: VecDeque::new(),
                from_client: Vec::new(),
                received: Vec::new(),
                closed: false,
                offline: false,
                connections: 0,
                connect_attempts: 0,
                connect_delay: Duration::ZERO,
                open_streams: 0,
                refusals: VecDeque::new(),
                session_present: false,
                answer_connect: true,
                answer_pings: true,
                ack_publishes: true,
                complete_pubrel: true,
                suback_codes: None,
                subscriptions: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    pub fn received(&self) -> Vec<Packet> {
        self.state.lock().received.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Packet) -> bool) -> usize {
        self.state.lock().received.iter().filter(|p| predicate(p)).count()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    /// Queues `packet` for the client to read.
    pub fn send(&self, packet: &Packet) {
        self.state.lock().push(packet);
    }

    /// Drops the current connection as if the peer went away.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Calls to the connector, including ones that failed or are still
    /// in progress.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Client streams not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.state.lock().open_streams
    }

    /// Makes every later connect sleep for `delay` before it succeeds.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Refuses the next CONNECT with `code`.
    pub fn refuse_next(&self, code: ConnectReturnCode) {
        self.state.lock().refusals.push_back(code);
    }

    /// While offline, new connections fail at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn set_session_present(&self, present: bool) {
        self.state.lock().session_present = present;
    }

    pub fn set_answer_connect(&self, answer: bool) {
        self.state.lock().answer_connect = answer;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.lock().answer_pings = answer;
    }

    pub fn set_ack_publishes(&self, ack: bool) {
        self.state.lock().ack_publishes = ack;
    }

    pub fn set_complete_pubrel(&self, complete: bool) {
        self.state.lock().complete_pubrel = complete;
    }

    /// Return codes for the next SUBACK instead of granting what was asked.
    pub fn set_suback_codes(&self, codes: Vec<SubAckReturnCode>) {
        self.state.lock().suback_codes = Some(codes);
    }
}

pub struct MemoryConnector {
    broker: Broker,
}

impl Connector for MemoryConnector {
    type Transport = MemoryStream;

    fn connect(&mut self, _host: &str, _port: u16) -> Result<MemoryStream, mqtt_session::Error> {
        let delay = {
            let mut state = self.broker.state.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.broker.state.lock();

        if state.offline {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }

        state.connections += 1;
        state.to_client.clear();
        state.from_client.clear();
        state.closed = false;
        state.open_streams += 1;

        Ok(MemoryStream {
            broker: self.broker.clone(),
            connection: state.connections,
        })
    }
}

/// Client end of an in-memory connection. A stream from an earlier
/// connection reads as closed.
pub struct MemoryStream {
    broker: Broker,
    connection: usize,
}

impl MemoryStream {
    fn is_stale(&self, state: &State) -> bool {
        state.connections != self.connection
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.broker.state.lock().open_streams -= 1;
    }
}

impl ErrorType for MemoryStream {
    type Error = ErrorKind;
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.broker.state.lock();

        if self.is_stale(&state) {
            return Ok(0);
        }

        let mut read = 0;
        while read < buf.len() {
            let Some(byte) = state.to_client.pop_front() else {
                break;
            };
            buf[read] = byte;
            read += 1;
        }

        Ok(read)
    }
}

impl ReadReady for MemoryStream {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        let state = self.broker.state.lock();

        Ok(self.is_stale(&state) || state.closed || !state.to_client.is_empty())
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.broker.state.lock();

        if self.is_stale(&state) || state.closed {
            return Err(ErrorKind::BrokenPipe);
        }

        state.from_client.extend_from_slice(buf);

        loop {
            let parsed = Packet::from_bytes(&state.from_client);
            let Ok((packet, used)) = parsed else {
                break;
            };

            state.from_client.drain(..used);
            state.respond(&packet);
            state.received.push(packet);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new("broker.test")
        .client_id("test-client")
        .keep_alive(10)
        .ack_timeout(Duration::from_secs(5))
        .tick(Duration::from_millis(1))
}

/// Blocking-mode client over `broker`; the test drives `mqtt_loop`.
pub fn blocking_client<const N: usize, const Q: usize>(
    broker: &Broker,
    config: ClientConfig,
) -> (TestClient<N, Q>, ManualClock) {
    let clock = ManualClock::new();
    let client = Client::with_clock(broker.connector(), config.blocking(true), clock.clone());

    (client, clock)
}

/// Runs `mqtt_loop` until `done` holds, or panics after a few hundred passes.
pub fn drive<const N: usize, const Q: usize>(client: &TestClient<N, Q>, done: impl Fn() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }

        client.mqtt_loop().expect("loop pass");
    }

    panic!("condition not reached");
}

/// Polls `done` in real time for up to two seconds.
pub fn wait_until(done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);

    while Instant::now() < deadline {
        if done() {
            return true;
        }

        thread::sleep(Duration::from_millis(1));
    }

    done()
}

pub fn is_publish(packet: &Packet) -> bool {
    matches!(packet, Packet::Publish(_))
}
