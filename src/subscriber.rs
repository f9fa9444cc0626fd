use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    Queue,
    inflight::{InFlight, WaitingSet},
    packet::{
        Packet, PacketId,
        subscribe::{SubAck, SubAckReturnCode, Subscribe, Subscription},
        unsubscribe::Unsubscribe,
    },
    packet_id_pool::PacketIdPool,
    sender::Sender,
    time::{self, SessionClock},
    topic,
    transport::Transport,
};

/// SUBACK/UNSUBACK bookkeeping and the table of effective subscriptions.
pub(crate) struct Subscriber<C: SessionClock, const N: usize> {
    suback: Mutex<WaitingSet<C, N>>,
    unsuback: Mutex<WaitingSet<C, N>>,
    subscribed: Mutex<Vec<Subscription>>,
    ids: Arc<Mutex<PacketIdPool>>,
    clock: C,
}

impl<C: SessionClock, const N: usize> Subscriber<C, N> {
    pub(crate) fn new(ids: Arc<Mutex<PacketIdPool>>, clock: C) -> Self {
        Self {
            suback: Mutex::new(WaitingSet::new(Queue::SubAck)),
            unsuback: Mutex::new(WaitingSet::new(Queue::UnsubAck)),
            subscribed: Mutex::new(Vec::new()),
            ids,
            clock,
        }
    }

    pub(crate) fn send_subscribe<T: Transport, const Q: usize>(
        &self,
        topics: Vec<Subscription>,
        sender: &Sender<T, C, Q>,
    ) -> Result<PacketId, crate::Error> {
        if topics.is_empty() {
            return Err(crate::Error::ProtocolViolation("subscribe needs at least one filter"));
        }

        for subscription in &topics {
            topic::validate_filter(&subscription.filter)?;
        }

        self.track(&self.suback, sender, |packet_id| {
            Packet::Subscribe(Subscribe { packet_id, topics })
        })
    }

    pub(crate) fn send_unsubscribe<T: Transport, const Q: usize>(
        &self,
        topics: Vec<String>,
        sender: &Sender<T, C, Q>,
    ) -> Result<PacketId, crate::Error> {
        if topics.is_empty() {
            return Err(crate::Error::ProtocolViolation("unsubscribe needs at least one filter"));
        }

        if topics.iter().any(String::is_empty) {
            return Err(crate::Error::ProtocolViolation("topic filter must not be empty"));
        }

        self.track(&self.unsuback, sender, |packet_id| {
            Packet::Unsubscribe(Unsubscribe { packet_id, topics })
        })
    }

    /// Allocates an id, records the waiting entry and queues the packet,
    /// undoing the first two if the queue refuses.
    fn track<T: Transport, const Q: usize>(
        &self,
        waiting: &Mutex<WaitingSet<C, N>>,
        sender: &Sender<T, C, Q>,
        build: impl FnOnce(PacketId) -> Packet,
    ) -> Result<PacketId, crate::Error> {
        let mut waiting = waiting.lock();

        let id = self.ids.lock().next_id()?;
        let packet = build(id);

        if let Err(err) = waiting.insert(InFlight::new(id, packet.clone(), time::now(&self.clock))) {
            self.ids.lock().release(id);
            return Err(err);
        }

        if let Err(err) = sender.enqueue(packet) {
            waiting.remove(id);
            self.ids.lock().release(id);
            return Err(err);
        }

        Ok(id)
    }

    /// Applies a SUBACK to the requested filters, position by position.
    /// Returns the subscriptions the broker granted.
    pub(crate) fn add_subscription(&self, suback: &SubAck) -> Result<Vec<Subscription>, crate::Error> {
        let id = suback.packet_id;

        let record = self
            .suback
            .lock()
            .remove(id)
            .ok_or(crate::Error::UnknownPacketId(id.get()))?;
        self.ids.lock().release(id);

        let Packet::Subscribe(request) = record.packet else {
            return Err(crate::Error::UnknownPacketId(id.get()));
        };

        if request.topics.len() != suback.return_codes.len() {
            warn!(
                "SUBACK {id} carries {} codes for {} filters",
                suback.return_codes.len(),
                request.topics.len()
            );
            return Err(crate::Error::MalformedPacket);
        }

        let mut granted = Vec::new();
        let mut subscribed = self.subscribed.lock();

        for (requested, code) in request.topics.into_iter().zip(&suback.return_codes) {
            subscribed.retain(|entry| entry.filter != requested.filter);

            match code {
                SubAckReturnCode::Success(qos) => {
                    if *qos < requested.qos {
                        info!("{} granted with QoS {qos:?}", requested.filter);
                    }

                    let entry = Subscription::new(requested.filter, *qos);
                    subscribed.push(entry.clone());
                    granted.push(entry);
                }
                SubAckReturnCode::Failure => {
                    warn!("broker rejected subscription to {}", requested.filter);
                }
            }
        }

        Ok(granted)
    }

    /// Applies an UNSUBACK: every table entry matched by an unsubscribed
    /// filter is removed. Returns the unsubscribed filters.
    pub(crate) fn remove_subscription(&self, id: PacketId) -> Result<Vec<String>, crate::Error> {
        let record = self
            .unsuback
            .lock()
            .remove(id)
            .ok_or(crate::Error::UnknownPacketId(id.get()))?;
        self.ids.lock().release(id);

        let Packet::Unsubscribe(request) = record.packet else {
            return Err(crate::Error::UnknownPacketId(id.get()));
        };

        self.subscribed.lock().retain(|entry| {
            !request
                .topics
                .iter()
                .any(|filter| topic::matches(&entry.filter, filter))
        });

        Ok(request.topics)
    }

    /// Sends the whole subscription table again after a reconnect on a fresh
    /// broker session. Entries stay in the table; the resulting SUBACK
    /// replaces or removes them.
    pub(crate) fn resubscribe<T: Transport, const Q: usize>(
        &self,
        sender: &Sender<T, C, Q>,
    ) -> Result<(), crate::Error> {
        let topics = self.subscribed.lock().clone();

        if topics.is_empty() {
            return Ok(());
        }

        let mut waiting = self.suback.lock();

        let id = self.ids.lock().next_id()?;
        let count = topics.len();
        let packet = Packet::Subscribe(Subscribe {
            packet_id: id,
            topics,
        });

        if let Err(err) = waiting.insert(InFlight::new(id, packet.clone(), time::now(&self.clock))) {
            self.ids.lock().release(id);
            return Err(err);
        }
        drop(waiting);

        info!("restoring {count} subscriptions");
        sender.send(&packet)
    }

    pub(crate) fn check_waiting<T: Transport, const Q: usize>(
        &self,
        ack_timeout_ms: u64,
        max_retries: Option<u32>,
        sender: &Sender<T, C, Q>,
    ) -> Result<(), crate::Error> {
        let now = time::now(&self.clock);

        for waiting in [&self.suback, &self.unsuback] {
            let expired = waiting.lock().expire(now, ack_timeout_ms, max_retries);

            {
                let mut ids = self.ids.lock();
                for id in expired.dropped {
                    ids.release(id);
                }
            }

            for packet in expired.resend {
                debug!("no acknowledgment in {ack_timeout_ms} ms, resending {packet}");
                sender.send(&packet)?;
            }
        }

        Ok(())
    }

    pub(crate) fn refresh(&self) {
        let now = time::now(&self.clock);
        self.suback.lock().refresh(now);
        self.unsuback.lock().refresh(now);
    }

    /// Drops pending SUBACK/UNSUBACK records. The subscription table stays.
    pub(crate) fn flush(&self) {
        self.suback.lock().clear();
        self.unsuback.lock().clear();
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subscribed.lock().clear();
    }

    pub(crate) fn subscribed_topics(&self) -> Vec<Subscription> {
        self.subscribed.lock().clone()
    }

    pub(crate) fn suback_full(&self) -> bool {
        self.suback.lock().is_full()
    }

    pub(crate) fn counts(&self) -> [usize; 2] {
        [self.suback.lock().len(), self.unsuback.lock().len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QoS, sender::SharedStream, time::ManualClock};

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

    fn fixture() -> (Subscriber<ManualClock, 4>, Sender<Null, ManualClock, 8>) {
        let clock = ManualClock::new();
        let ids = Arc::new(Mutex::new(PacketIdPool::new()));
        let stream: SharedStream<Null> = Arc::new(Mutex::new(Some(Null)));

        (
            Subscriber::new(ids, clock.clone()),
            Sender::new(stream, clock),
        )
    }

    fn suback(id: PacketId, codes: &[SubAckReturnCode]) -> SubAck {
        SubAck {
            packet_id: id,
            return_codes: codes.to_vec(),
        }
    }

    #[test]
    fn granted_and_rejected_codes() {
        let (subscriber, sender) = fixture();
        let id = subscriber
            .send_subscribe(
                vec![("a/b", QoS::AtLeastOnce).into(), ("c", QoS::ExactlyOnce).into()],
                &sender,
            )
            .unwrap();

        let granted = subscriber
            .add_subscription(&suback(
                id,
                &[SubAckReturnCode::Success(QoS::AtLeastOnce), SubAckReturnCode::Failure],
            ))
            .unwrap();

        assert_eq!(granted, [Subscription::new("a/b", QoS::AtLeastOnce)]);
        assert_eq!(subscriber.subscribed_topics(), granted);
        assert_eq!(subscriber.counts(), [0, 0]);
    }

    #[test]
    fn downgrade_replaces_existing_entry() {
        let (subscriber, sender) = fixture();

        for qos in [QoS::ExactlyOnce, QoS::AtMostOnce] {
            let id = subscriber.send_subscribe(vec![("a", qos).into()], &sender).unwrap();
            subscriber
                .add_subscription(&suback(id, &[SubAckReturnCode::Success(qos)]))
                .unwrap();
        }

        let table = subscriber.subscribed_topics();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].qos, QoS::AtMostOnce);
    }

    #[test]
    fn unknown_suback_is_packet_error() {
        let (subscriber, _) = fixture();
        let err = subscriber
            .add_subscription(&suback(PacketId::new(9).unwrap(), &[SubAckReturnCode::Failure]))
            .unwrap_err();

        assert!(matches!(err, crate::Error::UnknownPacketId(9)));
        assert_eq!(err.kind(), crate::ErrorKind::Packet);
    }

    #[test]
    fn suback_code_count_must_match_request() {
        let (subscriber, sender) = fixture();
        let id = subscriber
            .send_subscribe(
                vec![("a", QoS::AtMostOnce).into(), ("b", QoS::AtMostOnce).into()],
                &sender,
            )
            .unwrap();

        let err = subscriber
            .add_subscription(&suback(id, &[SubAckReturnCode::Success(QoS::AtMostOnce)]))
            .unwrap_err();

        assert!(matches!(err, crate::Error::MalformedPacket));
        assert_eq!(err.kind(), crate::ErrorKind::Packet);
        assert!(subscriber.subscribed_topics().is_empty());
        assert_eq!(subscriber.counts(), [0, 0]);
    }

    #[test]
    fn empty_requests_are_protocol_violations() {
        let (subscriber, sender) = fixture();

        assert!(matches!(
            subscriber.send_subscribe(vec![], &sender),
            Err(crate::Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            subscriber.send_subscribe(vec![("", QoS::AtMostOnce).into()], &sender),
            Err(crate::Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            subscriber.send_unsubscribe(vec![], &sender),
            Err(crate::Error::ProtocolViolation(_))
        ));
        assert!(matches!(
            subscriber.send_unsubscribe(vec![String::new()], &sender),
            Err(crate::Error::ProtocolViolation(_))
        ));
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn unsubscribe_prunes_matching_entries() {
        let (subscriber, sender) = fixture();
        let id = subscriber
            .send_subscribe(
                vec![
                    ("sport/tennis", QoS::AtMostOnce).into(),
                    ("sport/golf", QoS::AtMostOnce).into(),
                    ("news", QoS::AtMostOnce).into(),
                ],
                &sender,
            )
            .unwrap();
        subscriber
            .add_subscription(&suback(id, &[SubAckReturnCode::Success(QoS::AtMostOnce); 3]))
            .unwrap();

        let id = subscriber.send_unsubscribe(vec!["sport/#".into()], &sender).unwrap();
        assert_eq!(subscriber.remove_subscription(id).unwrap(), ["sport/#"]);
        assert_eq!(
            subscriber.subscribed_topics(),
            [Subscription::new("news", QoS::AtMostOnce)]
        );

        assert!(subscriber.remove_subscription(id).is_err());
    }

    #[test]
    fn resubscribe_sends_the_table() {
        let (subscriber, sender) = fixture();
        let id = subscriber
            .send_subscribe(vec![("a", QoS::AtLeastOnce).into()], &sender)
            .unwrap();
        subscriber
            .add_subscription(&suback(id, &[SubAckReturnCode::Success(QoS::AtLeastOnce)]))
            .unwrap();

        subscriber.resubscribe(&sender).unwrap();
        assert_eq!(subscriber.counts(), [1, 0]);
        assert_eq!(subscriber.subscribed_topics().len(), 1);

        // The restoring SUBSCRIBE took id 2 after the first was released.
        let id = PacketId::new(2).unwrap();
        subscriber
            .add_subscription(&suback(id, &[SubAckReturnCode::Success(QoS::AtMostOnce)]))
            .unwrap();
        assert_eq!(
            subscriber.subscribed_topics(),
            [Subscription::new("a", QoS::AtMostOnce)]
        );
    }

    #[test]
    fn resubscribe_with_a_full_waiting_set_keeps_the_table() {
        let (subscriber, sender) = fixture();
        let id = subscriber
            .send_subscribe(vec![("a", QoS::AtLeastOnce).into()], &sender)
            .unwrap();
        subscriber
            .add_subscription(&suback(id, &[SubAckReturnCode::Success(QoS::AtLeastOnce)]))
            .unwrap();

        for filter in ["b", "c", "d", "e"] {
            subscriber
                .send_subscribe(vec![(filter, QoS::AtMostOnce).into()], &sender)
                .unwrap();
        }

        assert!(matches!(
            subscriber.resubscribe(&sender),
            Err(crate::Error::QueueFull(Queue::SubAck))
        ));
        assert_eq!(
            subscriber.subscribed_topics(),
            [Subscription::new("a", QoS::AtLeastOnce)]
        );
        assert_eq!(subscriber.ids.lock().in_use(), 4);
    }
}
