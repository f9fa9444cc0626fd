use std::sync::Arc;

use embedded_io::Write;
use embedded_time::Instant;
use heapless::Deque;
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::{
    Queue,
    packet::Packet,
    time::{self, SessionClock},
    transport::Transport,
};

/// Stream slot shared by the write path and the read path. `None` while
/// disconnected.
pub(crate) type SharedStream<T> = Arc<Mutex<Option<T>>>;

/// Outbound half of the session: direct writes plus two bounded FIFO queues.
///
/// PUBLISH packets and control packets (acknowledgments, SUBSCRIBE,
/// UNSUBSCRIBE, PINGREQ) are queued separately and control traffic is always
/// flushed first, so a publish burst cannot starve handshakes.
pub(crate) struct Sender<T: Transport, C: SessionClock, const Q: usize> {
    stream: SharedStream<T>,
    control: Mutex<Deque<Packet, Q>>,
    publish: Mutex<Deque<Packet, Q>>,
    last_sent: Mutex<Instant<C>>,
    clock: C,
}

impl<T: Transport, C: SessionClock, const Q: usize> Sender<T, C, Q> {
    pub(crate) fn new(stream: SharedStream<T>, clock: C) -> Self {
        let now = time::now(&clock);

        Self {
            stream,
            control: Mutex::new(Deque::new()),
            publish: Mutex::new(Deque::new()),
            last_sent: Mutex::new(now),
            clock,
        }
    }

    /// Writes `packet` immediately.
    pub(crate) fn send(&self, packet: &Packet) -> Result<(), crate::Error> {
        let bytes = packet.encode()?;

        {
            let mut stream = self.stream.lock();
            let stream = stream.as_mut().ok_or(crate::Error::WriteFailure)?;

            stream
                .write_all(&bytes)
                .and_then(|_| stream.flush())
                .map_err(|err| {
                    error!("writing {packet} failed: {err:?}");
                    crate::Error::WriteFailure
                })?;
        }

        debug!("sent {packet}");
        *self.last_sent.lock() = time::now(&self.clock);

        Ok(())
    }

    /// Appends `packet` to its queue; fails with `QueueFull` at capacity.
    pub(crate) fn enqueue(&self, packet: Packet) -> Result<(), crate::Error> {
        let (queue, kind) = self.queue_for(&packet);

        queue.lock().push_back(packet).map_err(|_| {
            warn!("{kind:?} queue is full ({Q} packets)");
            crate::Error::QueueFull(kind)
        })
    }

    /// Queues an acknowledgment, writing it directly when the control queue
    /// has no room so the read loop never waits on itself.
    pub(crate) fn enqueue_or_send(&self, packet: Packet) -> Result<(), crate::Error> {
        let overflow = self.control.lock().push_back(packet);

        match overflow {
            Ok(()) => Ok(()),
            Err(packet) => {
                debug!("control queue full, writing {packet} directly");
                self.send(&packet)
            }
        }
    }

    /// Sends up to `max` queued packets, control traffic first.
    ///
    /// A failed write puts the packet back at the head of its queue and ends
    /// this flush.
    pub(crate) fn flush(&self, max: usize) -> Result<usize, crate::Error> {
        let mut sent = 0;

        for queue in [&self.control, &self.publish] {
            while sent < max {
                let Some(packet) = queue.lock().pop_front() else {
                    break;
                };

                if let Err(err) = self.send(&packet) {
                    // Room is guaranteed: the slot was freed by the pop above
                    // and `enqueue` only appends at the back.
                    let _ = queue.lock().push_front(packet);
                    return Err(err);
                }

                sent += 1;
            }
        }

        Ok(sent)
    }

    /// Sends everything queued, or drops it all when `discard` is set.
    pub(crate) fn flush_all(&self, discard: bool) -> Result<(), crate::Error> {
        if discard {
            self.clear();
            return Ok(());
        }

        while self.pending() > 0 {
            self.flush(usize::MAX)?;
        }

        Ok(())
    }

    pub(crate) fn clear(&self) {
        let dropped = self.pending();
        self.control.lock().clear();
        self.publish.lock().clear();

        if dropped > 0 {
            debug!("discarded {dropped} queued packets");
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.control.lock().len() + self.publish.lock().len()
    }

    pub(crate) fn pending_publish(&self) -> usize {
        self.publish.lock().len()
    }

    pub(crate) fn pending_control(&self) -> usize {
        self.control.lock().len()
    }

    pub(crate) fn attach(&self, stream: T) {
        *self.stream.lock() = Some(stream);
        *self.last_sent.lock() = time::now(&self.clock);
    }

    pub(crate) fn detach(&self) -> Option<T> {
        self.stream.lock().take()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub(crate) fn since_last_send(&self, now: &Instant<C>) -> u64 {
        time::elapsed_ms(&self.last_sent.lock(), now)
    }

    fn queue_for(&self, packet: &Packet) -> (&Mutex<Deque<Packet, Q>>, Queue) {
        match packet {
            Packet::Publish(_) => (&self.publish, Queue::Publish),
            _ => (&self.control, Queue::Control),
        }
    }
}
