use embedded_time::Instant;
use heapless::Vec;
use log::warn;

use crate::{
    Queue,
    packet::{Packet, PacketId},
    time::{self, SessionClock},
};

/// A packet waiting for its acknowledgment, kept so it can be resent.
#[derive(Clone)]
pub(crate) struct InFlight<C: SessionClock> {
    pub(crate) id: PacketId,
    pub(crate) packet: Packet,
    pub(crate) sent_at: Instant<C>,
    pub(crate) retries: u32,
}

impl<C: SessionClock> InFlight<C> {
    pub(crate) fn new(id: PacketId, packet: Packet, sent_at: Instant<C>) -> Self {
        Self {
            id,
            packet,
            sent_at,
            retries: 0,
        }
    }
}

/// Outcome of an acknowledgment timeout scan.
pub(crate) struct Expired {
    /// Packets to send again, already marked as duplicates.
    pub(crate) resend: std::vec::Vec<Packet>,
    /// Identifiers whose records hit the retry ceiling and were dropped.
    pub(crate) dropped: std::vec::Vec<PacketId>,
}

/// Bounded set of in-flight records for one kind of acknowledgment.
pub(crate) struct WaitingSet<C: SessionClock, const N: usize> {
    queue: Queue,
    records: Vec<InFlight<C>, N>,
}

impl<C: SessionClock, const N: usize> WaitingSet<C, N> {
    pub(crate) const fn new(queue: Queue) -> Self {
        Self {
            queue,
            records: Vec::new(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.records.is_full()
    }

    pub(crate) fn insert(&mut self, record: InFlight<C>) -> Result<(), crate::Error> {
        self.records.push(record).map_err(|_| {
            warn!("{:?} waiting set is full ({N} records)", self.queue);
            crate::Error::QueueFull(self.queue)
        })
    }

    pub(crate) fn contains(&self, id: PacketId) -> bool {
        self.records.iter().any(|record| record.id == id)
    }

    pub(crate) fn remove(&mut self, id: PacketId) -> Option<InFlight<C>> {
        let index = self.records.iter().position(|record| record.id == id)?;

        Some(self.records.remove(index))
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    /// Restarts every timer, e.g. after CONNACK on a resumed session.
    pub(crate) fn refresh(&mut self, now: Instant<C>) {
        for record in self.records.iter_mut() {
            record.sent_at = now;
        }
    }

    /// Collects records unacknowledged for at least `timeout_ms`.
    ///
    /// Each expired record is marked as a duplicate, its timer restarts and
    /// its packet is returned for resending. With a retry ceiling, records
    /// that already used every retry are removed instead.
    pub(crate) fn expire(
        &mut self,
        now: Instant<C>,
        timeout_ms: u64,
        max_retries: Option<u32>,
    ) -> Expired {
        let mut expired = Expired {
            resend: std::vec::Vec::new(),
            dropped: std::vec::Vec::new(),
        };

        self.records.retain_mut(|record| {
            if time::elapsed_ms(&record.sent_at, &now) < timeout_ms {
                return true;
            }

            if max_retries.is_some_and(|max| record.retries >= max) {
                warn!(
                    "{:?}: giving up on packet id {} after {} retries",
                    self.queue, record.id, record.retries
                );
                expired.dropped.push(record.id);
                return false;
            }

            record.retries += 1;
            record.sent_at = now;
            record.packet.set_dup();
            expired.resend.push(record.packet.clone());

            true
        });

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        QoS,
        packet::publish::Publish,
        time::{ManualClock, now},
    };

    fn publish(id: u16) -> (PacketId, Packet) {
        let id = PacketId::new(id).unwrap();
        let mut publish = Publish::new("t", b"x".to_vec(), QoS::AtLeastOnce, false);
        publish.packet_id = Some(id);

        (id, Packet::Publish(publish))
    }

    #[test]
    fn ceiling_is_queue_full() {
        let clock = ManualClock::new();
        let mut set = WaitingSet::<ManualClock, 2>::new(Queue::PubAck);

        for n in 1..=2 {
            let (id, packet) = publish(n);
            set.insert(InFlight::new(id, packet, now(&clock))).unwrap();
        }

        let (id, packet) = publish(3);
        assert!(set.is_full());
        assert!(matches!(
            set.insert(InFlight::new(id, packet, now(&clock))),
            Err(crate::Error::QueueFull(Queue::PubAck))
        ));
    }

    #[test]
    fn expired_records_resend_with_dup() {
        let clock = ManualClock::new();
        let mut set = WaitingSet::<ManualClock, 4>::new(Queue::PubAck);
        let (id, packet) = publish(1);
        set.insert(InFlight::new(id, packet, now(&clock))).unwrap();

        clock.advance(4_999);
        assert!(set.expire(now(&clock), 5_000, None).resend.is_empty());

        clock.advance(1);
        let expired = set.expire(now(&clock), 5_000, None);
        assert_eq!(expired.resend.len(), 1);
        assert!(matches!(&expired.resend[0], Packet::Publish(p) if p.flags.dup && p.packet_id == Some(id)));

        // timer restarted
        assert!(set.expire(now(&clock), 5_000, None).resend.is_empty());
        assert!(set.contains(id));
    }

    #[test]
    fn retry_ceiling_drops_record() {
        let clock = ManualClock::new();
        let mut set = WaitingSet::<ManualClock, 4>::new(Queue::PubAck);
        let (id, packet) = publish(1);
        set.insert(InFlight::new(id, packet, now(&clock))).unwrap();

        clock.advance(5_000);
        assert_eq!(set.expire(now(&clock), 5_000, Some(1)).resend.len(), 1);

        clock.advance(5_000);
        let expired = set.expire(now(&clock), 5_000, Some(1));
        assert!(expired.resend.is_empty());
        assert_eq!(expired.dropped, [id]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn remove_and_refresh() {
        let clock = ManualClock::new();
        let mut set = WaitingSet::<ManualClock, 4>::new(Queue::SubAck);
        let (id, packet) = publish(9);
        set.insert(InFlight::new(id, packet, now(&clock))).unwrap();

        clock.advance(10_000);
        set.refresh(now(&clock));
        assert!(set.expire(now(&clock), 5_000, None).resend.is_empty());

        assert!(set.remove(id).is_some());
        assert!(set.remove(id).is_none());
    }
}
