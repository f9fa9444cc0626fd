//! Connection lifecycle: connect, worker loop, housekeeping, reconnect and
//! disconnect.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use embedded_time::Instant;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    config::ClientConfig,
    handler::Handler,
    keep_alive::{KeepAlive, Verdict},
    packet::{
        Packet, PacketId, QoS,
        connect::{ConnAck, Connect, ConnectReturnCode},
        publish::Publish,
        subscribe::Subscription,
    },
    packet_id_pool::PacketIdPool,
    protocol::{ConnectionState, ProtocolVersion},
    publisher::Publisher,
    sender::{Sender, SharedStream},
    subscriber::Subscriber,
    time::{self, SessionClock},
    transport::Connector,
};

pub(crate) struct Session<K: Connector, C: SessionClock, const N: usize, const Q: usize> {
    config: ClientConfig,
    version: Mutex<ProtocolVersion>,
    connector: Mutex<K>,
    state: Mutex<ConnectionState>,
    pub(crate) sender: Sender<K::Transport, C, Q>,
    pub(crate) handler: Handler<K::Transport, C>,
    pub(crate) publisher: Publisher<C, N>,
    pub(crate) subscriber: Subscriber<C, N>,
    ids: Arc<Mutex<PacketIdPool>>,
    keep_alive: KeepAlive,
    connect_started: Mutex<Instant<C>>,
    /// Set by the reconnect path: resend the subscription table if the broker
    /// did not keep our session.
    restore_subscriptions: AtomicBool,
    /// The restoring SUBSCRIBE found the SUBACK waiting set full; housekeeping
    /// tries again once there is room.
    resubscribe_pending: AtomicBool,
    /// Bumped to stop the current worker; each worker runs while the value
    /// it was started with is current.
    worker_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<Result<(), crate::Error>>>>,
    /// Bumped whenever a reconnect sequence starts or is cancelled; older
    /// sequences notice and stop.
    reconnect_generation: AtomicU64,
    /// Held while a reconnect attempt attaches its stream and while a
    /// sequence is cancelled, so a cancelled attempt never attaches.
    attach_lock: Mutex<()>,
    /// Reconnect generation that attached the current stream; 0 for a
    /// caller-initiated connect.
    attached_sequence: AtomicU64,
    clock: C,
}

impl<K: Connector, C: SessionClock, const N: usize, const Q: usize> Session<K, C, N, Q> {
    pub(crate) fn new(connector: K, mut config: ClientConfig, clock: C) -> Self {
        config.resolve_client_id();

        let stream: SharedStream<K::Transport> = Arc::new(Mutex::new(None));
        let ids = Arc::new(Mutex::new(PacketIdPool::new()));
        let now = time::now(&clock);

        Self {
            version: Mutex::new(config.protocol_version),
            keep_alive: KeepAlive::new(config.keep_alive),
            connector: Mutex::new(connector),
            state: Mutex::new(ConnectionState::Disconnected),
            sender: Sender::new(stream.clone(), clock.clone()),
            handler: Handler::new(stream, clock.clone()),
            publisher: Publisher::new(ids.clone(), clock.clone()),
            subscriber: Subscriber::new(ids.clone(), clock.clone()),
            ids,
            connect_started: Mutex::new(now),
            restore_subscriptions: AtomicBool::new(false),
            resubscribe_pending: AtomicBool::new(false),
            worker_generation: AtomicU64::new(0),
            worker: Mutex::new(None),
            reconnect: Mutex::new(None),
            reconnect_generation: AtomicU64::new(0),
            attach_lock: Mutex::new(()),
            attached_sequence: AtomicU64::new(0),
            config,
            clock,
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);

        if previous != state {
            debug!("connection state {previous:?} -> {state:?}");
        }
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        *self.version.lock()
    }

    /// Connects and waits for CONNACK, then starts the worker unless the
    /// caller drives the loop itself.
    pub(crate) fn connect(self: &Arc<Self>) -> Result<(), crate::Error> {
        self.config.validate()?;
        self.ensure_disconnected()?;
        self.connect_blocking(None)?;
        self.start_worker();

        Ok(())
    }

    /// Sends CONNECT and returns at once; CONNACK is picked up by the loop.
    pub(crate) fn connect_async(self: &Arc<Self>) -> Result<(), crate::Error> {
        self.config.validate()?;
        self.ensure_disconnected()?;
        self.open(ConnectionState::ConnectAsync, None)?;
        self.start_worker();

        Ok(())
    }

    fn ensure_disconnected(&self) -> Result<(), crate::Error> {
        if self.state() != ConnectionState::Disconnected {
            return Err(crate::Error::ProtocolViolation("client is already connected"));
        }

        Ok(())
    }

    /// `sequence` is the reconnect generation driving this attempt, if any.
    fn connect_blocking(&self, sequence: Option<u64>) -> Result<(), crate::Error> {
        self.open(ConnectionState::New, sequence)?;

        match self.await_connack() {
            Err(crate::Error::ConnectionRefused(ConnectReturnCode::UnacceptableProtocolVersion))
                if self.protocol_version() == ProtocolVersion::V311 =>
            {
                info!("broker refused MQTT 3.1.1, retrying with 3.1");
                *self.version.lock() = ProtocolVersion::V31;

                self.open(ConnectionState::New, sequence)?;
                self.await_connack()
            }
            result => result,
        }
    }

    /// Opens a fresh stream and sends CONNECT over it.
    fn open(&self, state: ConnectionState, sequence: Option<u64>) -> Result<(), crate::Error> {
        let ClientConfig { host, port, .. } = &self.config;
        let version = self.protocol_version();

        info!(
            "connecting to {host}:{port} as {} (MQTT {version})",
            self.config.client_id
        );

        let transport = self.connector.lock().connect(host, *port)?;

        {
            let _attach = self.attach_lock.lock();

            if self.superseded(sequence) {
                debug!("reconnect cancelled, closing the new stream");
                return Err(crate::Error::NotConnected);
            }

            self.sender.attach(transport);
            self.attached_sequence
                .store(sequence.unwrap_or(0), Ordering::SeqCst);
            self.handler.reset();
            *self.connect_started.lock() = time::now(&self.clock);
            self.set_state(state);
        }

        let connect = Packet::Connect(self.connect_packet(version));
        if let Err(err) = self.sender.send(&connect) {
            self.drop_connection();
            return Err(err);
        }

        Ok(())
    }

    fn connect_packet(&self, version: ProtocolVersion) -> Connect {
        Connect {
            version,
            clean_session: self.config.clean_session,
            keep_alive: self.config.keep_alive,
            client_id: self.config.client_id.clone(),
            will: self.config.will.clone().map(Into::into),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }
    }

    fn await_connack(&self) -> Result<(), crate::Error> {
        let timeout_ms = self.config.ack_timeout_ms();
        let started = time::now(&self.clock);

        loop {
            match self.handler.poll_once(self) {
                Ok(_) if self.state() == ConnectionState::Connected => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    warn!("connection attempt failed: {err}");
                    self.drop_connection();
                    return Err(err);
                }
            }

            if time::elapsed_ms(&started, &time::now(&self.clock)) >= timeout_ms {
                warn!("no CONNACK within {timeout_ms} ms");
                self.drop_connection();
                return Err(crate::Error::ConnackTimeout);
            }

            thread::sleep(self.config.tick);
        }
    }

    /// Applies an accepted CONNACK: timers restart and everything queued
    /// while disconnected goes out.
    pub(crate) fn on_connack(&self, connack: &ConnAck) -> Result<(), crate::Error> {
        if connack.return_code != ConnectReturnCode::Accepted {
            warn!("broker refused the connection: {:?}", connack.return_code);
            return Err(crate::Error::ConnectionRefused(connack.return_code));
        }

        self.set_state(ConnectionState::Connected);
        self.publisher.refresh();
        self.subscriber.refresh();

        self.resubscribe_pending.store(false, Ordering::SeqCst);
        let restore = self.restore_subscriptions.swap(false, Ordering::SeqCst);
        if restore && !connack.session_present {
            self.restore_table()?;
        }

        self.sender.flush_all(false)
    }

    fn restore_table(&self) -> Result<(), crate::Error> {
        match self.subscriber.resubscribe(&self.sender) {
            Ok(()) => {
                self.resubscribe_pending.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(crate::Error::QueueFull(queue)) => {
                warn!("{queue:?} waiting set is full, restoring subscriptions later");
                self.resubscribe_pending.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn start_worker(self: &Arc<Self>) {
        if self.config.blocking {
            return;
        }

        let previous = self.worker.lock().take();
        if let Some(previous) = previous {
            if previous.thread().id() != thread::current().id() {
                let _ = previous.join();
            }
        }

        let generation = self.worker_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let session = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("mqtt-session".into())
            .spawn(move || Self::run(session, generation));

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(err) => error!("cannot spawn the session worker: {err}"),
        }
    }

    /// Worker body. It holds the session only for the length of a pass, so
    /// dropping the last client handle ends the loop.
    fn run(session: Weak<Self>, generation: u64) {
        debug!("worker started");

        loop {
            let Some(this) = session.upgrade() else {
                debug!("session dropped");
                break;
            };

            if this.worker_generation.load(Ordering::SeqCst) != generation {
                break;
            }

            let state = this.state();
            if state != ConnectionState::Connected && !state.is_connecting() {
                break;
            }

            if this.mqtt_loop().is_err() {
                break;
            }

            let tick = this.config.tick;
            drop(this);
            thread::sleep(tick);
        }

        debug!("worker stopped");
    }

    /// One read, write and housekeeping pass. A failure tears the connection
    /// down and, when persistent, starts reconnecting.
    pub(crate) fn mqtt_loop(self: &Arc<Self>) -> Result<(), crate::Error> {
        if self.state() == ConnectionState::Disconnected {
            return Err(crate::Error::NotConnected);
        }

        let result = self
            .read_budget()
            .and_then(|_| self.write_budget())
            .and_then(|_| self.housekeeping());

        self.on_failure(result)
    }

    pub(crate) fn loop_read(self: &Arc<Self>) -> Result<usize, crate::Error> {
        self.on_failure(self.read_budget())
    }

    pub(crate) fn loop_write(self: &Arc<Self>) -> Result<usize, crate::Error> {
        self.on_failure(self.write_budget())
    }

    pub(crate) fn loop_misc(self: &Arc<Self>) -> Result<(), crate::Error> {
        self.on_failure(self.housekeeping())
    }

    fn on_failure<T>(self: &Arc<Self>, result: Result<T, crate::Error>) -> Result<T, crate::Error> {
        if let Err(err) = &result {
            self.connection_lost(err);
        }

        result
    }

    /// Reads up to the configured number of packets.
    fn read_budget(&self) -> Result<usize, crate::Error> {
        let mut read = 0;

        while read < self.config.max_read && self.handler.poll_once(self)? {
            read += 1;
        }

        Ok(read)
    }

    /// Writes up to the configured number of queued packets. Nothing leaves
    /// the queues before CONNACK.
    fn write_budget(&self) -> Result<usize, crate::Error> {
        if self.state() != ConnectionState::Connected {
            return Ok(0);
        }

        self.sender.flush(self.config.max_write)
    }

    /// Keep-alive, CONNACK timeout and acknowledgment retransmission.
    fn housekeeping(&self) -> Result<(), crate::Error> {
        let now = time::now(&self.clock);

        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::New | ConnectionState::ConnectAsync => {
                let waited = time::elapsed_ms(&self.connect_started.lock(), &now);

                if waited >= self.config.ack_timeout_ms() {
                    warn!("no CONNACK within {waited} ms");
                    return Err(crate::Error::ConnackTimeout);
                }

                return Ok(());
            }
            ConnectionState::Disconnected => return Err(crate::Error::NotConnected),
        }

        let since_send = self.sender.since_last_send(&now);
        let since_receive = self.handler.since_last_receive(&now);

        match self.keep_alive.check(since_send, since_receive) {
            Verdict::Idle => {}
            Verdict::Ping => {
                debug!("{since_send} ms since last send, pinging");
                self.sender.send(&Packet::PingReq)?;
            }
            Verdict::Expired => {
                warn!("nothing received for {since_receive} ms, keep-alive expired");
                return Err(crate::Error::KeepAliveTimeout);
            }
        }

        if self.resubscribe_pending.load(Ordering::SeqCst) && !self.subscriber.suback_full() {
            self.restore_table()?;
        }

        let ack_timeout_ms = self.config.ack_timeout_ms();
        let max_retries = self.config.max_retries;

        self.publisher
            .check_waiting(ack_timeout_ms, max_retries, &self.sender)?;
        self.subscriber
            .check_waiting(ack_timeout_ms, max_retries, &self.sender)
    }

    fn connection_lost(self: &Arc<Self>, err: &crate::Error) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        warn!("connection lost: {err}");
        self.drop_connection();

        let refused = matches!(err, crate::Error::ConnectionRefused(_));
        if self.config.persistent && !refused {
            self.spawn_reconnect();
        }
    }

    /// Closes the stream without a DISCONNECT packet. Queued packets survive
    /// only on a persistent session.
    fn drop_connection(&self) {
        drop(self.sender.detach());
        self.set_state(ConnectionState::Disconnected);

        if !self.config.persistent {
            self.sender.clear();
        }
    }

    /// Starts a new reconnect sequence generation; older sequences stop at
    /// their next check and never attach a stream.
    fn next_sequence(&self) -> u64 {
        let _attach = self.attach_lock.lock();
        self.reconnect_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn superseded(&self, sequence: Option<u64>) -> bool {
        sequence.is_some_and(|generation| {
            self.reconnect_generation.load(Ordering::SeqCst) != generation
        })
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let generation = self.next_sequence();
        let session = Arc::clone(self);

        let mut slot = self.reconnect.lock();
        let spawned = thread::Builder::new()
            .name("mqtt-reconnect".into())
            .spawn(move || session.reconnect_with(generation));

        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(err) => error!("cannot spawn the reconnect thread: {err}"),
        }
    }

    /// Retries the connection on the calling thread, preempting any
    /// background sequence.
    pub(crate) fn reconnect(self: &Arc<Self>) -> Result<(), crate::Error> {
        self.config.validate()?;
        self.stop_worker();

        let generation = self.next_sequence();
        self.reconnect_with(generation)
    }

    fn reconnect_with(self: &Arc<Self>, generation: u64) -> Result<(), crate::Error> {
        let attempts = self.config.reconnect_attempts.max(1);

        for attempt in 1..=attempts {
            if self.superseded(Some(generation)) {
                debug!("reconnect sequence superseded");
                return Ok(());
            }

            info!("reconnect attempt {attempt} of {attempts}");

            if self.sender.is_attached() {
                self.drop_connection();
            }

            self.restore_subscriptions.store(true, Ordering::SeqCst);

            match self.connect_blocking(Some(generation)) {
                Ok(()) => {
                    let attach = self.attach_lock.lock();

                    if self.superseded(Some(generation)) {
                        // Leave a stream attached by a newer attempt alone.
                        if self.attached_sequence.load(Ordering::SeqCst) == generation {
                            debug!("reconnect cancelled after CONNACK");
                            self.drop_connection();
                        }
                        return Ok(());
                    }

                    drop(attach);

                    self.start_worker();
                    return Ok(());
                }
                Err(err) if self.superseded(Some(generation)) => {
                    debug!("reconnect sequence superseded during attempt {attempt}: {err}");
                    return Ok(());
                }
                Err(err) => warn!("reconnect attempt {attempt} failed: {err}"),
            }

            if attempt < attempts {
                thread::sleep(self.config.reconnect_interval);
            }
        }

        self.restore_subscriptions.store(false, Ordering::SeqCst);
        error!("could not reconnect after {attempts} attempts");

        Err(crate::Error::ReconnectExhausted { attempts })
    }

    /// Joins the background reconnect sequence, if one was started.
    pub(crate) fn wait_reconnect(&self) -> Result<(), crate::Error> {
        let handle = self.reconnect.lock().take();

        match handle {
            Some(handle) => handle.join().map_err(|_| crate::Error::ConnectionClosed)?,
            None => Ok(()),
        }
    }

    /// Ends the connection. An explicit disconnect sends what is queued,
    /// then DISCONNECT, and forgets every in-flight packet; otherwise the
    /// stream is just dropped.
    pub(crate) fn disconnect(&self, explicit: bool) -> Result<(), crate::Error> {
        self.next_sequence();
        self.stop_worker();

        let mut result = Ok(());

        if explicit {
            if self.state() == ConnectionState::Connected {
                if let Err(err) = self.sender.flush_all(false) {
                    warn!("could not send queued packets before disconnecting: {err}");
                }

                result = self.sender.send(&Packet::Disconnect);
            }

            self.sender.clear();
            self.publisher.flush();
            self.subscriber.flush();
            self.ids.lock().clear();
            self.resubscribe_pending.store(false, Ordering::SeqCst);

            if self.config.clean_session {
                self.subscriber.clear_subscriptions();
            }
        }

        self.drop_connection();
        info!("disconnected");

        result
    }

    fn stop_worker(&self) {
        self.worker_generation.fetch_add(1, Ordering::SeqCst);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                // Called from a callback; the loop exits on its next check.
                return;
            }

            if worker.join().is_err() {
                error!("session worker panicked");
            }
        }
    }

    pub(crate) fn ping_host(&self) -> Result<(), crate::Error> {
        if self.state() != ConnectionState::Connected {
            return Err(crate::Error::NotConnected);
        }

        self.sender.send(&Packet::PingReq)
    }

    pub(crate) fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<Option<PacketId>, crate::Error> {
        let publish = Publish::new(topic, payload, qos, retain);

        self.publisher.send_publish(publish, &self.sender)
    }

    pub(crate) fn subscribe(&self, topics: Vec<Subscription>) -> Result<PacketId, crate::Error> {
        self.subscriber.send_subscribe(topics, &self.sender)
    }

    pub(crate) fn unsubscribe(&self, topics: Vec<String>) -> Result<PacketId, crate::Error> {
        self.subscriber.send_unsubscribe(topics, &self.sender)
    }
}
