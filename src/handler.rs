//! Inbound path: reads one packet at a time and routes it.

use embedded_time::Instant;
use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    callback::{Callbacks, Event},
    packet::{Packet, connect::ConnAck},
    parser,
    protocol::PacketType,
    sender::SharedStream,
    session::Session,
    time::{self, SessionClock},
    transport::{self, Connector, Transport},
};

pub(crate) struct Handler<T: Transport, C: SessionClock> {
    stream: SharedStream<T>,
    last_received: Mutex<Instant<C>>,
    pub(crate) callbacks: Callbacks,
    clock: C,
}

impl<T: Transport, C: SessionClock> Handler<T, C> {
    pub(crate) fn new(stream: SharedStream<T>, clock: C) -> Self {
        let now = time::now(&clock);

        Self {
            stream,
            last_received: Mutex::new(now),
            callbacks: Callbacks::default(),
            clock,
        }
    }

    /// Reads and dispatches one packet if the stream has data.
    ///
    /// Returns `Ok(false)` without blocking when nothing is readable. The
    /// stream lock is released before dispatching, so acknowledgments and
    /// callbacks can write.
    pub(crate) fn poll_once<K, const N: usize, const Q: usize>(
        &self,
        session: &Session<K, C, N, Q>,
    ) -> Result<bool, crate::Error>
    where
        K: Connector<Transport = T>,
    {
        let packet = {
            let mut stream = self.stream.lock();
            let stream = stream.as_mut().ok_or(crate::Error::NotConnected)?;

            if !stream.read_ready().map_err(transport::stream_error)? {
                return Ok(false);
            }

            parser::read_packet(stream)?
        };

        *self.last_received.lock() = time::now(&self.clock);
        debug!("received {packet}");

        self.dispatch(packet, session)?;

        Ok(true)
    }

    fn dispatch<K, const N: usize, const Q: usize>(
        &self,
        packet: Packet,
        session: &Session<K, C, N, Q>,
    ) -> Result<(), crate::Error>
    where
        K: Connector<Transport = T>,
    {
        let packet_type = packet.packet_type();

        match packet {
            Packet::ConnAck(connack) => return self.on_connack(&connack, session),
            _ if session.state().is_connecting() => {
                return Err(crate::Error::ProtocolViolation("packet received before CONNACK"));
            }
            Packet::Publish(publish) => {
                if session.publisher.do_publish(&publish, &session.sender)? {
                    self.callbacks.emit(Event::Received(&publish));
                }
            }
            Packet::PubAck(id) => {
                if session.publisher.do_puback(id) {
                    self.callbacks.emit(Event::PubAck(id));
                }
            }
            Packet::PubRec(id) => {
                if session.publisher.do_pubrec(id, &session.sender)? {
                    self.callbacks.emit(Event::PubRec(id));
                }
            }
            Packet::PubRel(id) => {
                if session.publisher.do_pubrel(id, &session.sender)? {
                    self.callbacks.emit(Event::PubRel(id));
                }
            }
            Packet::PubComp(id) => {
                if session.publisher.do_pubcomp(id) {
                    self.callbacks.emit(Event::PubComp(id));
                }
            }
            Packet::SubAck(suback) => {
                let granted = session.subscriber.add_subscription(&suback)?;
                self.callbacks.emit(Event::Subscribed(&granted));
            }
            Packet::UnsubAck(id) => {
                let removed = session.subscriber.remove_subscription(id)?;
                self.callbacks.emit(Event::Unsubscribed(&removed));
            }
            Packet::PingReq => session.sender.enqueue_or_send(Packet::PingResp)?,
            Packet::PingResp => {}
            Packet::Connect(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::Disconnect => {
                return Err(crate::Error::UnexpectedPacket(packet_type));
            }
        }

        Ok(())
    }

    fn on_connack<K, const N: usize, const Q: usize>(
        &self,
        connack: &ConnAck,
        session: &Session<K, C, N, Q>,
    ) -> Result<(), crate::Error>
    where
        K: Connector<Transport = T>,
    {
        if !session.state().is_connecting() {
            return Err(crate::Error::UnexpectedPacket(PacketType::ConnAck));
        }

        session.on_connack(connack)?;
        info!("connected, session present: {}", connack.session_present);

        self.callbacks.emit(Event::Connected(connack));

        Ok(())
    }

    /// Restarts the receive timer, e.g. when a fresh stream is attached.
    pub(crate) fn reset(&self) {
        *self.last_received.lock() = time::now(&self.clock);
    }

    pub(crate) fn since_last_receive(&self, now: &Instant<C>) -> u64 {
        time::elapsed_ms(&self.last_received.lock(), now)
    }
}
