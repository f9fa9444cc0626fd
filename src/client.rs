use std::sync::Arc;

use crate::{
    config::ClientConfig,
    packet::{PacketId, QoS, connect::ConnAck, publish::Publish, subscribe::Subscription},
    protocol::{ConnectionState, ProtocolVersion},
    session::Session,
    time::{SessionClock, StdClock},
    transport::Connector,
};

/// MQTT client handle.
///
/// `N` bounds each acknowledgment waiting set and `Q` each outbound queue.
/// Clones share one session, so the handle can be moved into callbacks and
/// other threads. Once the last handle is dropped the worker thread exits and
/// the stream is closed without DISCONNECT. A handle captured by a callback
/// counts as a handle.
pub struct Client<K: Connector, C: SessionClock = StdClock, const N: usize = 20, const Q: usize = 64> {
    session: Arc<Session<K, C, N, Q>>,
}

impl<K: Connector, C: SessionClock, const N: usize, const Q: usize> Clone for Client<K, C, N, Q> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

/// Occupancy of the waiting sets and outbound queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InflightCounts {
    pub puback: usize,
    pub pubrec: usize,
    pub pubrel: usize,
    pub pubcomp: usize,
    pub suback: usize,
    pub unsuback: usize,
    pub queued_control: usize,
    pub queued_publish: usize,
}

impl<K: Connector, const N: usize, const Q: usize> Client<K, StdClock, N, Q> {
    pub fn new(connector: K, config: ClientConfig) -> Self {
        Self::with_clock(connector, config, StdClock::default())
    }
}

impl<K: Connector, C: SessionClock, const N: usize, const Q: usize> Client<K, C, N, Q> {
    pub fn with_clock(connector: K, config: ClientConfig, clock: C) -> Self {
        Self {
            session: Arc::new(Session::new(connector, config, clock)),
        }
    }

    /// Connects and blocks until CONNACK or the acknowledgment timeout.
    ///
    /// Unless the configuration asks for blocking mode, a worker thread then
    /// drives the session.
    pub fn connect(&self) -> Result<(), crate::Error> {
        self.session.connect()
    }

    /// Sends CONNECT without waiting for CONNACK.
    pub fn connect_async(&self) -> Result<(), crate::Error> {
        self.session.connect_async()
    }

    /// Closes the connection.
    ///
    /// With `explicit` set, queued packets are sent and followed by
    /// DISCONNECT, and every unacknowledged packet is forgotten. Without it
    /// the stream is dropped and the broker publishes the last will.
    pub fn disconnect(&self, explicit: bool) -> Result<(), crate::Error> {
        self.session.disconnect(explicit)
    }

    /// Retries the connection on the calling thread up to the configured
    /// number of attempts.
    pub fn reconnect(&self) -> Result<(), crate::Error> {
        self.session.reconnect()
    }

    /// Waits for a background reconnect started after a lost connection.
    pub fn wait_reconnect(&self) -> Result<(), crate::Error> {
        self.session.wait_reconnect()
    }

    /// Queues a PUBLISH. Returns the packet identifier for QoS 1 and 2.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
        qos: QoS,
    ) -> Result<Option<PacketId>, crate::Error> {
        self.session.publish(topic, payload.into(), retain, qos)
    }

    pub fn subscribe<S: AsRef<str>>(&self, topics: &[(S, QoS)]) -> Result<PacketId, crate::Error> {
        let topics = topics
            .iter()
            .map(|(filter, qos)| Subscription::new(filter.as_ref(), *qos))
            .collect();

        self.session.subscribe(topics)
    }

    pub fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<PacketId, crate::Error> {
        let topics = topics.iter().map(|topic| topic.as_ref().to_owned()).collect();

        self.session.unsubscribe(topics)
    }

    pub fn on_connack<F>(&self, callback: F)
    where
        F: Fn(&ConnAck) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_connack(Arc::new(callback));
    }

    /// Called for every delivered PUBLISH, before any topic callback.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Publish) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_message(Arc::new(callback));
    }

    /// Called with the filters a SUBACK granted.
    pub fn on_suback<F>(&self, callback: F)
    where
        F: Fn(&[Subscription]) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_suback(Arc::new(callback));
    }

    pub fn on_unsuback<F>(&self, callback: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_unsuback(Arc::new(callback));
    }

    pub fn on_puback<F>(&self, callback: F)
    where
        F: Fn(PacketId) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_puback(Arc::new(callback));
    }

    pub fn on_pubrec<F>(&self, callback: F)
    where
        F: Fn(PacketId) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_pubrec(Arc::new(callback));
    }

    pub fn on_pubrel<F>(&self, callback: F)
    where
        F: Fn(PacketId) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_pubrel(Arc::new(callback));
    }

    pub fn on_pubcomp<F>(&self, callback: F)
    where
        F: Fn(PacketId) + Send + Sync + 'static,
    {
        self.session.handler.callbacks.set_on_pubcomp(Arc::new(callback));
    }

    /// Registers a callback for messages published on exactly `topic`.
    pub fn register_topic_callback<F>(&self, topic: &str, callback: F) -> Result<(), crate::Error>
    where
        F: Fn(&Publish) + Send + Sync + 'static,
    {
        self.session
            .handler
            .callbacks
            .register_topic(topic, Arc::new(callback))
    }

    pub fn clear_topic_callback(&self, topic: &str) -> Result<(), crate::Error> {
        self.session.handler.callbacks.clear_topic(topic)
    }

    /// One pass of reading, writing and housekeeping, for blocking mode.
    ///
    /// A failure closes the connection (and starts reconnecting when the
    /// session is persistent) before it is returned.
    pub fn mqtt_loop(&self) -> Result<(), crate::Error> {
        self.session.mqtt_loop()
    }

    /// Reads and dispatches the packets available right now, up to the read
    /// budget. Returns how many were handled.
    ///
    /// This and the two methods below close the connection on failure, like
    /// [`Client::mqtt_loop`].
    pub fn loop_read(&self) -> Result<usize, crate::Error> {
        self.session.loop_read()
    }

    /// Sends queued packets, up to the write budget.
    pub fn loop_write(&self) -> Result<usize, crate::Error> {
        self.session.loop_write()
    }

    /// Keep-alive and retransmission housekeeping.
    pub fn loop_misc(&self) -> Result<(), crate::Error> {
        self.session.loop_misc()
    }

    /// Sends a PINGREQ right away.
    pub fn ping_host(&self) -> Result<(), crate::Error> {
        self.session.ping_host()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Protocol version in use; 3.1 after a fallback.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.session.protocol_version()
    }

    pub fn client_id(&self) -> &str {
        &self.session.config().client_id
    }

    pub fn config(&self) -> &ClientConfig {
        self.session.config()
    }

    /// Filters the broker has granted, with their granted QoS.
    pub fn subscribed_topics(&self) -> Vec<Subscription> {
        self.session.subscriber.subscribed_topics()
    }

    pub fn inflight_counts(&self) -> InflightCounts {
        let [puback, pubrec, pubrel, pubcomp] = self.session.publisher.counts();
        let [suback, unsuback] = self.session.subscriber.counts();

        InflightCounts {
            puback,
            pubrec,
            pubrel,
            pubcomp,
            suback,
            unsuback,
            queued_control: self.session.sender.pending_control(),
            queued_publish: self.session.sender.pending_publish(),
        }
    }
}
