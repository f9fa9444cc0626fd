use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::packet::{
    PacketId,
    connect::ConnAck,
    publish::Publish,
    subscribe::Subscription,
};

pub(crate) type ConnAckCallback = Arc<dyn Fn(&ConnAck) + Send + Sync>;
pub(crate) type MessageCallback = Arc<dyn Fn(&Publish) + Send + Sync>;
pub(crate) type SubAckCallback = Arc<dyn Fn(&[Subscription]) + Send + Sync>;
pub(crate) type UnsubAckCallback = Arc<dyn Fn(&[String]) + Send + Sync>;
pub(crate) type AckCallback = Arc<dyn Fn(PacketId) + Send + Sync>;

/// Something the broker told us that the application may want to hear about.
pub(crate) enum Event<'a> {
    Connected(&'a ConnAck),
    Received(&'a Publish),
    /// Filters the broker granted, with their granted QoS.
    Subscribed(&'a [Subscription]),
    Unsubscribed(&'a [String]),
    PubAck(PacketId),
    PubRec(PacketId),
    PubRel(PacketId),
    PubComp(PacketId),
}

#[derive(Default)]
struct Registry {
    on_connack: Option<ConnAckCallback>,
    on_message: Option<MessageCallback>,
    on_suback: Option<SubAckCallback>,
    on_unsuback: Option<UnsubAckCallback>,
    on_puback: Option<AckCallback>,
    on_pubrec: Option<AckCallback>,
    on_pubrel: Option<AckCallback>,
    on_pubcomp: Option<AckCallback>,
    topics: HashMap<String, MessageCallback>,
}

/// User callbacks. Callbacks are cloned out of the lock before they run, so
/// a callback may call back into the client.
#[derive(Default)]
pub(crate) struct Callbacks {
    registry: RwLock<Registry>,
}

impl Callbacks {
    pub(crate) fn set_on_connack(&self, callback: ConnAckCallback) {
        self.registry.write().on_connack = Some(callback);
    }

    pub(crate) fn set_on_message(&self, callback: MessageCallback) {
        self.registry.write().on_message = Some(callback);
    }

    pub(crate) fn set_on_suback(&self, callback: SubAckCallback) {
        self.registry.write().on_suback = Some(callback);
    }

    pub(crate) fn set_on_unsuback(&self, callback: UnsubAckCallback) {
        self.registry.write().on_unsuback = Some(callback);
    }

    pub(crate) fn set_on_puback(&self, callback: AckCallback) {
        self.registry.write().on_puback = Some(callback);
    }

    pub(crate) fn set_on_pubrec(&self, callback: AckCallback) {
        self.registry.write().on_pubrec = Some(callback);
    }

    pub(crate) fn set_on_pubrel(&self, callback: AckCallback) {
        self.registry.write().on_pubrel = Some(callback);
    }

    pub(crate) fn set_on_pubcomp(&self, callback: AckCallback) {
        self.registry.write().on_pubcomp = Some(callback);
    }

    /// Registers the callback for messages on exactly `topic`, replacing any
    /// previous one.
    pub(crate) fn register_topic(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<(), crate::Error> {
        if topic.is_empty() {
            return Err(crate::Error::Parameter("callback topic must not be empty"));
        }

        self.registry.write().topics.insert(topic.to_owned(), callback);

        Ok(())
    }

    pub(crate) fn clear_topic(&self, topic: &str) -> Result<(), crate::Error> {
        if topic.is_empty() {
            return Err(crate::Error::Parameter("callback topic must not be empty"));
        }

        self.registry.write().topics.remove(topic);

        Ok(())
    }

    pub(crate) fn emit(&self, event: Event<'_>) {
        match event {
            Event::Connected(connack) => {
                let callback = self.registry.read().on_connack.clone();
                if let Some(callback) = callback {
                    callback(connack);
                }
            }
            Event::Received(publish) => {
                let (general, topic) = {
                    let registry = self.registry.read();
                    (
                        registry.on_message.clone(),
                        registry.topics.get(&publish.topic).cloned(),
                    )
                };

                for callback in general.into_iter().chain(topic) {
                    callback(publish);
                }
            }
            Event::Subscribed(granted) => {
                let callback = self.registry.read().on_suback.clone();
                if let Some(callback) = callback {
                    callback(granted);
                }
            }
            Event::Unsubscribed(filters) => {
                let callback = self.registry.read().on_unsuback.clone();
                if let Some(callback) = callback {
                    callback(filters);
                }
            }
            Event::PubAck(id) => self.emit_ack(|r| &r.on_puback, id),
            Event::PubRec(id) => self.emit_ack(|r| &r.on_pubrec, id),
            Event::PubRel(id) => self.emit_ack(|r| &r.on_pubrel, id),
            Event::PubComp(id) => self.emit_ack(|r| &r.on_pubcomp, id),
        }
    }

    fn emit_ack(&self, slot: impl FnOnce(&Registry) -> &Option<AckCallback>, id: PacketId) {
        let callback = slot(&self.registry.read()).clone();

        if let Some(callback) = callback {
            callback(id);
        }
    }
}
