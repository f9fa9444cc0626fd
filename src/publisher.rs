//! QoS 1/2 delivery state.
//!
//! Outbound QoS 1 waits in `puback`. Outbound QoS 2 waits in `pubrec`, then
//! moves to `pubcomp` once PUBREL is on its way. Inbound QoS 2 waits in
//! `pubrel` between our PUBREC and the broker's PUBREL.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    Queue,
    inflight::{InFlight, WaitingSet},
    packet::{Packet, PacketId, QoS, publish::Publish},
    packet_id_pool::PacketIdPool,
    sender::Sender,
    time::{self, SessionClock},
    topic,
    transport::Transport,
};

pub(crate) struct Publisher<C: SessionClock, const N: usize> {
    puback: Mutex<WaitingSet<C, N>>,
    pubrec: Mutex<WaitingSet<C, N>>,
    pubrel: Mutex<WaitingSet<C, N>>,
    pubcomp: Mutex<WaitingSet<C, N>>,
    ids: Arc<Mutex<PacketIdPool>>,
    clock: C,
}

impl<C: SessionClock, const N: usize> Publisher<C, N> {
    pub(crate) fn new(ids: Arc<Mutex<PacketIdPool>>, clock: C) -> Self {
        Self {
            puback: Mutex::new(WaitingSet::new(Queue::PubAck)),
            pubrec: Mutex::new(WaitingSet::new(Queue::PubRec)),
            pubrel: Mutex::new(WaitingSet::new(Queue::PubRel)),
            pubcomp: Mutex::new(WaitingSet::new(Queue::PubComp)),
            ids,
            clock,
        }
    }

    /// Queues an application PUBLISH. QoS 1/2 messages get a packet id and a
    /// waiting record; if the outbound queue refuses the packet both are
    /// rolled back.
    pub(crate) fn send_publish<T: Transport, const Q: usize>(
        &self,
        mut publish: Publish,
        sender: &Sender<T, C, Q>,
    ) -> Result<Option<PacketId>, crate::Error> {
        topic::validate_topic(&publish.topic)?;

        let waiting = match publish.qos() {
            QoS::AtMostOnce => {
                sender.enqueue(Packet::Publish(publish))?;
                return Ok(None);
            }
            QoS::AtLeastOnce => &self.puback,
            QoS::ExactlyOnce => &self.pubrec,
        };

        let mut waiting = waiting.lock();
        if waiting.is_full() {
            return Err(crate::Error::QueueFull(if publish.qos() == QoS::AtLeastOnce {
                Queue::PubAck
            } else {
                Queue::PubRec
            }));
        }

        let id = self.ids.lock().next_id()?;
        publish.packet_id = Some(id);
        let packet = Packet::Publish(publish);

        waiting.insert(InFlight::new(id, packet.clone(), time::now(&self.clock)))?;

        if let Err(err) = sender.enqueue(packet) {
            waiting.remove(id);
            self.ids.lock().release(id);
            return Err(err);
        }

        Ok(Some(id))
    }

    /// Acknowledges an inbound PUBLISH. Returns whether it should be handed
    /// to the application: a QoS 2 retransmission still awaiting PUBREL is
    /// acknowledged again but not delivered twice.
    pub(crate) fn do_publish<T: Transport, const Q: usize>(
        &self,
        publish: &Publish,
        sender: &Sender<T, C, Q>,
    ) -> Result<bool, crate::Error> {
        let Some(id) = publish.packet_id else {
            return Ok(true);
        };

        match publish.qos() {
            QoS::AtMostOnce => Ok(true),
            QoS::AtLeastOnce => {
                sender.enqueue_or_send(Packet::PubAck(id))?;
                Ok(true)
            }
            QoS::ExactlyOnce => {
                let fresh = {
                    let mut waiting = self.pubrel.lock();

                    if waiting.contains(id) {
                        debug!("duplicate QoS 2 publish {id}, acknowledging again");
                        false
                    } else {
                        waiting.insert(InFlight::new(
                            id,
                            Packet::PubRec(id),
                            time::now(&self.clock),
                        ))?;
                        true
                    }
                };

                sender.enqueue_or_send(Packet::PubRec(id))?;
                Ok(fresh)
            }
        }
    }

    pub(crate) fn do_puback(&self, id: PacketId) -> bool {
        let known = self.puback.lock().remove(id).is_some();
        self.finish(id, known, "PUBACK")
    }

    /// Moves an outbound QoS 2 message from awaiting PUBREC to awaiting
    /// PUBCOMP and queues PUBREL. A repeated PUBREC is ignored.
    pub(crate) fn do_pubrec<T: Transport, const Q: usize>(
        &self,
        id: PacketId,
        sender: &Sender<T, C, Q>,
    ) -> Result<bool, crate::Error> {
        let Some(record) = self.pubrec.lock().remove(id) else {
            debug!("ignoring PUBREC {id}: not awaiting one");
            return Ok(false);
        };

        let inserted = self.pubcomp.lock().insert(InFlight::new(
            id,
            Packet::PubRel(id),
            time::now(&self.clock),
        ));

        if let Err(err) = inserted {
            // Keep waiting for PUBREC; the broker resends it after our retry.
            let _ = self.pubrec.lock().insert(record);
            return Err(err);
        }

        sender.enqueue_or_send(Packet::PubRel(id))?;

        Ok(true)
    }

    /// Completes an inbound QoS 2 delivery. PUBCOMP is sent even for an
    /// unknown id so a broker retrying PUBREL can finish.
    pub(crate) fn do_pubrel<T: Transport, const Q: usize>(
        &self,
        id: PacketId,
        sender: &Sender<T, C, Q>,
    ) -> Result<bool, crate::Error> {
        let known = self.pubrel.lock().remove(id).is_some();

        if !known {
            debug!("PUBREL {id} for a delivery already completed");
        }

        sender.enqueue_or_send(Packet::PubComp(id))?;

        Ok(known)
    }

    pub(crate) fn do_pubcomp(&self, id: PacketId) -> bool {
        let known = self.pubcomp.lock().remove(id).is_some();
        self.finish(id, known, "PUBCOMP")
    }

    fn finish(&self, id: PacketId, known: bool, ack: &str) -> bool {
        if known {
            self.ids.lock().release(id);
        } else {
            info!("ignoring {ack} {id}: no publish is waiting for it");
        }

        known
    }

    /// Restarts every acknowledgment timer.
    pub(crate) fn refresh(&self) {
        let now = time::now(&self.clock);

        for waiting in self.sets() {
            waiting.lock().refresh(now);
        }
    }

    /// Resends records older than `ack_timeout_ms` and drops the ones past the
    /// retry ceiling.
    pub(crate) fn check_waiting<T: Transport, const Q: usize>(
        &self,
        ack_timeout_ms: u64,
        max_retries: Option<u32>,
        sender: &Sender<T, C, Q>,
    ) -> Result<(), crate::Error> {
        let now = time::now(&self.clock);

        // Inbound ids in `pubrel` were chosen by the broker, not our pool.
        let sets = [
            (&self.puback, true),
            (&self.pubrec, true),
            (&self.pubrel, false),
            (&self.pubcomp, true),
        ];

        for (waiting, pooled) in sets {
            let expired = waiting.lock().expire(now, ack_timeout_ms, max_retries);

            if pooled {
                let mut ids = self.ids.lock();
                for id in expired.dropped {
                    ids.release(id);
                }
            }

            for packet in expired.resend {
                info!("no acknowledgment in {ack_timeout_ms} ms, resending {packet}");
                sender.send(&packet)?;
            }
        }

        Ok(())
    }

    /// Drops every waiting record.
    pub(crate) fn flush(&self) {
        for waiting in self.sets() {
            waiting.lock().clear();
        }
    }

    pub(crate) fn counts(&self) -> [usize; 4] {
        self.sets().map(|waiting| waiting.lock().len())
    }

    fn sets(&self) -> [&Mutex<WaitingSet<C, N>>; 4] {
        [&self.puback, &self.pubrec, &self.pubrel, &self.pubcomp]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{sender::SharedStream, time::ManualClock};

    struct Null;

    impl embedded_io::ErrorType for Null {
        type Error = embedded_io::ErrorKind;
    }

    impl embedded_io::Read for Null {
        fn read(&mut self, _: &mut [u8]) -> Result<usize, Self::Error> {
            Ok(0)
        }
    }

    impl embedded_io::ReadReady for Null {
        fn read_ready(&mut self) -> Result<bool, Self::Error> {
            Ok(false)
        }
    }

    impl embedded_io::Write for Null {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    struct Fixture {
        clock: ManualClock,
        ids: Arc<Mutex<PacketIdPool>>,
        publisher: Publisher<ManualClock, 2>,
        sender: Sender<Null, ManualClock, 8>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new();
        let ids = Arc::new(Mutex::new(PacketIdPool::new()));
        let stream: SharedStream<Null> = Arc::new(Mutex::new(Some(Null)));

        Fixture {
            publisher: Publisher::new(ids.clone(), clock.clone()),
            sender: Sender::new(stream, clock.clone()),
            clock,
            ids,
        }
    }

    fn outbound(qos: QoS) -> Publish {
        Publish::new("t", b"hi".to_vec(), qos, false)
    }

    fn inbound(id: u16, qos: QoS) -> Publish {
        let mut publish = Publish::new("t", b"hi".to_vec(), qos, false);
        publish.packet_id = PacketId::new(id);
        publish
    }

    #[test]
    fn qos0_is_untracked() {
        let f = fixture();

        assert_eq!(f.publisher.send_publish(outbound(QoS::AtMostOnce), &f.sender).unwrap(), None);
        assert_eq!(f.publisher.counts(), [0; 4]);
        assert_eq!(f.sender.pending_publish(), 1);
    }

    #[test]
    fn qos1_until_puback() {
        let f = fixture();
        let id = f
            .publisher
            .send_publish(outbound(QoS::AtLeastOnce), &f.sender)
            .unwrap()
            .unwrap();

        assert_eq!(f.publisher.counts(), [1, 0, 0, 0]);
        assert!(f.publisher.do_puback(id));
        assert!(!f.publisher.do_puback(id));
        assert_eq!(f.ids.lock().in_use(), 0);
    }

    #[test]
    fn puback_ceiling() {
        let f = fixture();

        for _ in 0..2 {
            f.publisher.send_publish(outbound(QoS::AtLeastOnce), &f.sender).unwrap();
        }

        assert!(matches!(
            f.publisher.send_publish(outbound(QoS::AtLeastOnce), &f.sender),
            Err(crate::Error::QueueFull(Queue::PubAck))
        ));
        assert_eq!(f.ids.lock().in_use(), 2);
    }

    #[test]
    fn qos2_handshake_with_duplicate_pubrec() {
        let f = fixture();
        let id = f
            .publisher
            .send_publish(outbound(QoS::ExactlyOnce), &f.sender)
            .unwrap()
            .unwrap();
        assert_eq!(f.publisher.counts(), [0, 1, 0, 0]);

        assert!(f.publisher.do_pubrec(id, &f.sender).unwrap());
        assert_eq!(f.publisher.counts(), [0, 0, 0, 1]);
        assert_eq!(f.sender.pending_control(), 1);

        assert!(!f.publisher.do_pubrec(id, &f.sender).unwrap());
        assert_eq!(f.sender.pending_control(), 1);

        assert!(f.publisher.do_pubcomp(id));
        assert_eq!(f.publisher.counts(), [0; 4]);
        assert_eq!(f.ids.lock().in_use(), 0);
    }

    #[test]
    fn inbound_qos2_delivered_once() {
        let f = fixture();
        let publish = inbound(7, QoS::ExactlyOnce);

        assert!(f.publisher.do_publish(&publish, &f.sender).unwrap());
        assert!(!f.publisher.do_publish(&publish, &f.sender).unwrap());
        assert_eq!(f.sender.pending_control(), 2);
        assert_eq!(f.publisher.counts(), [0, 0, 1, 0]);

        let id = PacketId::new(7).unwrap();
        assert!(f.publisher.do_pubrel(id, &f.sender).unwrap());
        assert!(!f.publisher.do_pubrel(id, &f.sender).unwrap());
        assert_eq!(f.sender.pending_control(), 4);
    }

    #[test]
    fn inbound_qos1_acknowledged() {
        let f = fixture();

        assert!(f.publisher.do_publish(&inbound(3, QoS::AtLeastOnce), &f.sender).unwrap());
        assert_eq!(f.sender.pending_control(), 1);
        assert_eq!(f.publisher.counts(), [0; 4]);
    }

    #[test]
    fn timeout_resends_and_ceiling_releases() {
        let f = fixture();
        f.publisher.send_publish(outbound(QoS::AtLeastOnce), &f.sender).unwrap();

        f.clock.advance(5_000);
        f.publisher.check_waiting(5_000, Some(1), &f.sender).unwrap();
        assert_eq!(f.publisher.counts(), [1, 0, 0, 0]);

        f.clock.advance(5_000);
        f.publisher.check_waiting(5_000, Some(1), &f.sender).unwrap();
        assert_eq!(f.publisher.counts(), [0; 4]);
        assert_eq!(f.ids.lock().in_use(), 0);
    }

    #[test]
    fn empty_topic_is_a_parameter_error() {
        let f = fixture();
        let publish = Publish::new("", Vec::new(), QoS::AtLeastOnce, false);

        assert!(matches!(
            f.publisher.send_publish(publish, &f.sender),
            Err(crate::Error::Parameter(_))
        ));
    }
}
