//! Live-query client: one logical connection shared by every subscription.
//!
//! Handles:
//!
//! - Transport lifecycle and the connect handshake
//! - Reconnection with exponential backoff, gated by a circuit breaker
//! - Re-subscription of every live subscription after reconnect
//! - Heartbeats, with a forced reconnect when the link goes stale
//! - Routing inbound change events through the bounded event queue to the
//!   owning subscription's handlers
//! - Connection lifecycle callbacks (`open`, `close`, `error`)
//!
//! Background threads (frame reader, heartbeat timer, reconnect loop, queue
//! consumer) only hold weak references to the client; dropping the
//! [`Client`] closes it.

use crate::backoff::ReconnectBackoff;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerInfo};
use crate::config::ClientConfig;
use crate::error::{LiveQueryError, Result, SubscriptionError};
use crate::health::{HealthInfo, HealthMonitor, HeartbeatHooks};
use crate::logging::Logger;
use crate::protocol::{self, ClientMessage, ConnectRequestBody, ServerMessage};
use crate::queue::{EventQueue, QueueStats};
use crate::subscription::{Subscription, SubscriptionState};
use crate::transport::{ConnectRequest, Connection, DisconnectReason, Transport, TransportEvent};
use crate::types::{ConnectionState, Event, RequestId, Timestamp};
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// How long `close` waits for queued events to be delivered.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle event kinds for [`Client::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Open,
    Close,
    Error,
}

/// Payload handed to connection lifecycle callbacks.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionNotice {
    /// Handshake accepted; subscriptions are being (re)sent.
    Opened { client_id: Option<String> },
    /// The link closed, by the caller or otherwise.
    Closed(DisconnectReason),
    /// A connection-level failure.
    Error {
        message: String,
        /// Whether the client will keep trying on its own.
        recoverable: bool,
    },
}

impl ConnectionNotice {
    pub fn kind(&self) -> ConnectionEvent {
        match self {
            ConnectionNotice::Opened { .. } => ConnectionEvent::Open,
            ConnectionNotice::Closed(_) => ConnectionEvent::Close,
            ConnectionNotice::Error { .. } => ConnectionEvent::Error,
        }
    }
}

type NoticeCallback = Arc<dyn Fn(&ConnectionNotice) + Send + Sync>;

/// Subscription counts by state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionCounts {
    pub total: usize,
    pub pending: usize,
    pub subscribed: usize,
    pub error: usize,
}

/// Aggregated diagnostics snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientDiagnostics {
    pub state: ConnectionState,
    pub client_id: Option<String>,
    pub reconnecting: bool,
    pub reconnect_attempts: u32,
    pub circuit: CircuitBreakerInfo,
    /// Present while a connection is up.
    pub health: Option<HealthInfo>,
    pub queue: QueueStats,
    pub subscriptions: SubscriptionCounts,
    /// Redacted configuration.
    pub config: serde_json::Value,
}

/// The open link and its frame reader.
struct Link {
    generation: u64,
    connection: Arc<dyn Connection>,
    /// Dropping this stops the reader thread.
    _cancel: Sender<()>,
}

#[derive(Default)]
struct ReconnectState {
    active: bool,
    /// Dropping this wakes and stops the loop.
    cancel: Option<Sender<()>>,
    run: u64,
}

type HandshakeSlot = Option<(u64, Sender<Result<Option<String>>>)>;

struct Shared {
    config: RwLock<ClientConfig>,
    transport: Arc<dyn Transport>,
    logger: RwLock<Logger>,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    handshake: Mutex<HandshakeSlot>,
    client_id: Mutex<Option<String>>,
    breaker: RwLock<Arc<CircuitBreaker>>,
    health: Mutex<Option<Arc<HealthMonitor>>>,
    queue: RwLock<Arc<EventQueue<Event>>>,
    subscriptions: RwLock<HashMap<RequestId, Arc<Subscription>>>,
    callbacks: RwLock<Vec<(ConnectionEvent, NoticeCallback)>>,
    reconnect: Mutex<ReconnectState>,
    reconnect_attempts: AtomicU32,
}

impl Shared {
    fn logger(&self) -> Logger {
        self.logger.read().clone()
    }

    fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker.read())
    }

    fn queue(&self) -> Arc<EventQueue<Event>> {
        Arc::clone(&self.queue.read())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

/// Live-query client.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Validate `config`, start the event queue and, with `auto_connect`,
    /// connect.
    ///
    /// A failed initial connect is an error only when `auto_reconnect` is
    /// off; otherwise reconnection is scheduled and the client is returned.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let logger = Logger::from_config(&config).for_component("client");

        let shared = Arc::new(Shared {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            handshake: Mutex::new(None),
            client_id: Mutex::new(None),
            breaker: RwLock::new(Arc::new(build_breaker(&config, &logger))),
            health: Mutex::new(None),
            queue: RwLock::new(Arc::new(build_queue(&config, &logger))),
            subscriptions: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            reconnect: Mutex::new(ReconnectState::default()),
            reconnect_attempts: AtomicU32::new(0),
            logger: RwLock::new(logger),
            config: RwLock::new(config),
        });
        start_queue(&shared, &shared.queue())?;

        let client = Self { shared };
        let (auto_connect, auto_reconnect) = {
            let config = client.shared.config.read();
            (config.auto_connect, config.auto_reconnect)
        };
        if auto_connect {
            if let Err(e) = client.connect() {
                if !auto_reconnect {
                    return Err(e);
                }
                client
                    .shared
                    .logger()
                    .warn(format_args!("initial connect failed ({e}); will retry"));
                schedule_reconnect(&client.shared);
            }
        }
        Ok(client)
    }

    /// Connect now and wait for the handshake.
    ///
    /// While the circuit is open the attempt is deferred: with
    /// `auto_reconnect` the reconnect loop takes over and this returns
    /// `Ok(())` with the client still disconnected (see
    /// [`diagnostics`](Self::diagnostics)). Without it the refusal is
    /// returned as [`LiveQueryError::CircuitOpen`].
    pub fn connect(&self) -> Result<()> {
        match connect_once(&self.shared) {
            Err(LiveQueryError::CircuitOpen { retry_in })
                if self.shared.config.read().auto_reconnect =>
            {
                self.shared.logger().info(format_args!(
                    "circuit open; connect deferred to reconnect loop (retry in {retry_in:?})"
                ));
                schedule_reconnect(&self.shared);
                Ok(())
            }
            other => other,
        }
    }

    /// Drop the link without reconnecting. Subscriptions are kept and sent
    /// again by the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        cancel_reconnect(&self.shared);
        let was_connected = {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Closed | ConnectionState::Disconnected => return,
                previous => {
                    *state = ConnectionState::Disconnected;
                    previous == ConnectionState::Connected
                }
            }
        };
        signal_handshake_any(&self.shared, Err(LiveQueryError::NotConnected));
        teardown_link(&self.shared);
        reset_subscriptions(&self.shared);
        if was_connected {
            notify(
                &self.shared,
                ConnectionNotice::Closed(DisconnectReason::with_code("client disconnected", 1000)),
            );
        }
    }

    /// Close permanently. Queued events are delivered (bounded wait), then
    /// every background thread stops. Idempotent.
    pub fn close(&self) {
        close_shared(&self.shared);
    }

    /// Replace the configuration after validating it.
    ///
    /// New settings take effect on the next connection attempt. The circuit
    /// breaker and event queue are rebuilt only while disconnected.
    pub fn reconfigure(&self, config: ClientConfig) -> Result<()> {
        config.validate()?;
        let state = self.shared.state();
        if state == ConnectionState::Closed {
            return Err(LiveQueryError::Closed);
        }

        let logger = Logger::from_config(&config).for_component("client");
        if state == ConnectionState::Disconnected {
            *self.shared.breaker.write() = Arc::new(build_breaker(&config, &logger));

            let queue = Arc::new(build_queue(&config, &logger));
            start_queue(&self.shared, &queue)?;
            let previous = std::mem::replace(&mut *self.shared.queue.write(), queue);
            previous.stop(true, CLOSE_DRAIN_TIMEOUT);
        }
        *self.shared.logger.write() = logger;
        *self.shared.config.write() = config;
        Ok(())
    }

    // --- Subscriptions ---

    /// Subscribe to `class_name` objects matching `where_clause`.
    pub fn subscribe(
        &self,
        class_name: impl Into<String>,
        where_clause: serde_json::Value,
    ) -> Result<Arc<Subscription>> {
        self.subscribe_to(Subscription::new(class_name).with_where(where_clause))
    }

    /// Register a prepared subscription. It is sent now when connected,
    /// otherwise as soon as a connection is established.
    pub fn subscribe_to(&self, subscription: Subscription) -> Result<Arc<Subscription>> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(LiveQueryError::Closed);
        }
        let subscription = Arc::new(subscription);
        self.shared
            .subscriptions
            .write()
            .insert(subscription.request_id(), Arc::clone(&subscription));
        self.shared.logger().debug(format_args!(
            "registered subscription {} on {}",
            subscription.request_id(),
            subscription.class_name()
        ));

        if self.shared.state() == ConnectionState::Connected {
            send_subscribe(&self.shared, &subscription);
        }
        Ok(subscription)
    }

    /// Tear down a subscription. Returns false for unknown ids.
    pub fn unsubscribe(&self, request_id: RequestId) -> Result<bool> {
        let Some(subscription) = self.shared.subscriptions.write().remove(&request_id) else {
            return Ok(false);
        };
        let was_sent = subscription.was_sent();
        subscription.mark_unsubscribed();

        if was_sent && self.shared.state() == ConnectionState::Connected {
            if let Err(e) = send_message(&self.shared, &subscription.to_unsubscribe_message()) {
                self.shared
                    .logger()
                    .warn(format_args!("failed to send unsubscribe for {request_id}: {e}"));
            }
        }
        Ok(true)
    }

    pub fn subscription(&self, request_id: RequestId) -> Option<Arc<Subscription>> {
        self.shared.subscriptions.read().get(&request_id).cloned()
    }

    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        let mut subs: Vec<_> = self.shared.subscriptions.read().values().cloned().collect();
        subs.sort_by_key(|s| s.request_id());
        subs
    }

    // --- Lifecycle callbacks ---

    /// Register a connection lifecycle callback.
    pub fn on(
        &self,
        event: ConnectionEvent,
        callback: impl Fn(&ConnectionNotice) + Send + Sync + 'static,
    ) -> &Self {
        let callback: NoticeCallback = Arc::new(callback);
        self.shared.callbacks.write().push((event, callback));
        self
    }

    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.on(ConnectionEvent::Open, move |_| callback())
    }

    pub fn on_close(&self, callback: impl Fn(&DisconnectReason) + Send + Sync + 'static) -> &Self {
        self.on(ConnectionEvent::Close, move |notice| {
            if let ConnectionNotice::Closed(reason) = notice {
                callback(reason);
            }
        })
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.on(ConnectionEvent::Error, move |notice| {
            if let ConnectionNotice::Error { message, .. } = notice {
                callback(message);
            }
        })
    }

    // --- Diagnostics ---

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Client id assigned by the server in the last handshake.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.lock().clone()
    }

    pub fn config(&self) -> ClientConfig {
        self.shared.config.read().clone()
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        self.shared.breaker()
    }

    pub fn health_info(&self) -> Option<HealthInfo> {
        self.shared.health.lock().as_ref().map(|h| h.health_info())
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue().stats()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnect.lock().active
    }

    pub fn diagnostics(&self) -> ClientDiagnostics {
        let mut counts = SubscriptionCounts::default();
        for sub in self.shared.subscriptions.read().values() {
            counts.total += 1;
            match sub.state() {
                SubscriptionState::Pending => counts.pending += 1,
                SubscriptionState::Subscribed => counts.subscribed += 1,
                SubscriptionState::Error => counts.error += 1,
                SubscriptionState::Unsubscribed => {}
            }
        }

        ClientDiagnostics {
            state: self.state(),
            client_id: self.client_id(),
            reconnecting: self.is_reconnecting(),
            reconnect_attempts: self.reconnect_attempts(),
            circuit: self.shared.breaker().info(),
            health: self.health_info(),
            queue: self.queue_stats(),
            subscriptions: counts,
            config: self.shared.config.read().to_redacted(),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        close_shared(&self.shared);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("subscriptions", &self.shared.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

// ── Construction helpers ────────────────────────────────────────────────────

fn build_breaker(config: &ClientConfig, logger: &Logger) -> CircuitBreaker {
    CircuitBreaker::new(
        config.circuit_failure_threshold,
        config.circuit_reset_timeout,
        logger.clone(),
    )
}

fn build_queue(config: &ClientConfig, logger: &Logger) -> EventQueue<Event> {
    let queue = EventQueue::new(
        config.event_queue_size,
        config.backpressure_strategy,
        config.queue_block_timeout,
        logger.clone(),
    );
    let logger = logger.clone();
    queue.on_drop(move |event: &Event, reason| {
        logger.warn(format_args!(
            "dropped {} event for subscription {} ({reason:?})",
            event.event_type, event.request_id
        ));
    });
    queue
}

/// Start `queue` with a processor routing each event to its subscription.
fn start_queue(shared: &Arc<Shared>, queue: &EventQueue<Event>) -> Result<()> {
    let weak = Arc::downgrade(shared);
    queue.start(move |event: Event| {
        let Some(shared) = weak.upgrade() else {
            return Ok(());
        };
        let subscription = shared.subscriptions.read().get(&event.request_id).cloned();
        match subscription {
            Some(subscription) => subscription.dispatch(&event).map(|_| ()),
            None => {
                shared.logger().debug(format_args!(
                    "no subscription {} for {} event",
                    event.request_id, event.event_type
                ));
                Ok(())
            }
        }
    })
}

// ── Connecting ──────────────────────────────────────────────────────────────

fn connect_once(shared: &Arc<Shared>) -> Result<()> {
    {
        let mut state = shared.state.lock();
        match *state {
            ConnectionState::Closed => return Err(LiveQueryError::Closed),
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {
                return Err(LiveQueryError::Connection("connect already in progress".into()))
            }
            ConnectionState::Disconnected => *state = ConnectionState::Connecting,
        }
    }

    let breaker = shared.breaker();
    if !breaker.allow_request() {
        set_state_unless_closed(shared, ConnectionState::Disconnected);
        return Err(LiveQueryError::CircuitOpen {
            retry_in: breaker.time_until_half_open(),
        });
    }

    let logger = shared.logger();
    match open_link(shared) {
        Ok(client_id) => {
            {
                let mut state = shared.state.lock();
                if *state != ConnectionState::Connecting {
                    let closed = *state == ConnectionState::Closed;
                    drop(state);
                    breaker.release_probe();
                    teardown_link(shared);
                    return Err(if closed {
                        LiveQueryError::Closed
                    } else {
                        LiveQueryError::NotConnected
                    });
                }
                *state = ConnectionState::Connected;
            }
            breaker.record_success();
            shared.reconnect_attempts.store(0, Ordering::SeqCst);
            *shared.client_id.lock() = client_id.clone();
            logger.info(format_args!("connected (client id {client_id:?})"));

            start_heartbeat(shared);
            flush_subscriptions(shared);
            notify(shared, ConnectionNotice::Opened { client_id });
            Ok(())
        }
        Err(e) => {
            shared.handshake.lock().take();
            teardown_link(shared);
            set_state_unless_closed(shared, ConnectionState::Disconnected);
            // the caller cut the attempt short
            if matches!(e, LiveQueryError::Closed | LiveQueryError::NotConnected) {
                breaker.release_probe();
                return Err(e);
            }
            breaker.record_failure();
            logger.warn(format_args!("connect failed: {e}"));
            let recoverable = shared.config.read().auto_reconnect;
            notify(
                shared,
                ConnectionNotice::Error {
                    message: e.to_string(),
                    recoverable,
                },
            );
            Err(e)
        }
    }
}

/// Open the transport, send the handshake and wait for `connected`.
fn open_link(shared: &Arc<Shared>) -> Result<Option<String>> {
    let config = shared.config.read().clone();
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let (handshake_tx, handshake_rx) = bounded(1);
    *shared.handshake.lock() = Some((generation, handshake_tx));

    let request = ConnectRequest {
        endpoint: config.endpoint.clone(),
        tls_min_version: config.tls_min_version,
        tls_max_version: config.tls_max_version,
        timeout: config.connect_timeout,
    };
    let (events_tx, events_rx) = unbounded();
    let connection: Arc<dyn Connection> = Arc::from(shared.transport.connect(&request, events_tx)?);

    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    *shared.link.lock() = Some(Link {
        generation,
        connection: Arc::clone(&connection),
        _cancel: cancel_tx,
    });

    let weak = Arc::downgrade(shared);
    thread::Builder::new()
        .name("livequery-reader".to_string())
        .spawn(move || run_reader(weak, generation, events_rx, cancel_rx))?;

    let handshake = ClientMessage::Connect(ConnectRequestBody {
        application_id: config.application_id.clone(),
        client_key: config.client_key.clone(),
        master_key: config.master_key.clone(),
        session_token: config.session_token.clone(),
    });
    connection.send_text(&serde_json::to_string(&handshake)?)?;

    match handshake_rx.recv_timeout(config.connect_timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(LiveQueryError::HandshakeTimeout(config.connect_timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(LiveQueryError::Connection("handshake abandoned".into()))
        }
    }
}

/// Deliver a handshake outcome to the `open_link` waiting on `generation`.
fn signal_handshake(shared: &Shared, generation: u64, result: Result<Option<String>>) -> bool {
    let mut slot = shared.handshake.lock();
    match slot.as_ref() {
        Some((pending, _)) if *pending == generation => {}
        _ => return false,
    }
    if let Some((_, tx)) = slot.take() {
        let _ = tx.send(result);
    }
    true
}

fn signal_handshake_any(shared: &Shared, result: Result<Option<String>>) {
    if let Some((_, tx)) = shared.handshake.lock().take() {
        let _ = tx.send(result);
    }
}

fn set_state_unless_closed(shared: &Shared, next: ConnectionState) {
    let mut state = shared.state.lock();
    if *state != ConnectionState::Closed {
        *state = next;
    }
}

fn start_heartbeat(shared: &Arc<Shared>) {
    let (generation, ping_interval, pong_timeout) = {
        let config = shared.config.read();
        let generation = shared.link.lock().as_ref().map(|l| l.generation);
        (generation, config.ping_interval, config.pong_timeout)
    };
    let Some(generation) = generation else {
        return;
    };

    let monitor = Arc::new(HealthMonitor::new(ping_interval, pong_timeout, shared.logger()));
    let hooks = Arc::new(LinkHooks {
        shared: Arc::downgrade(shared),
        generation,
    });
    match monitor.start(hooks) {
        Ok(()) => {
            let previous = shared.health.lock().replace(monitor);
            if let Some(previous) = previous {
                previous.stop();
            }
        }
        Err(e) => shared
            .logger()
            .error(format_args!("failed to start heartbeat: {e}")),
    }
}

/// Heartbeat hooks bound to one link.
struct LinkHooks {
    shared: Weak<Shared>,
    generation: u64,
}

impl HeartbeatHooks for LinkHooks {
    fn send_ping(&self) -> Result<()> {
        let shared = self.shared.upgrade().ok_or(LiveQueryError::Closed)?;
        let connection = current_connection(&shared, Some(self.generation))?;
        connection.send_ping()
    }

    fn connection_stale(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared
            .logger()
            .warn(format_args!("heartbeat timed out; forcing reconnect"));
        handle_link_lost(
            &shared,
            self.generation,
            DisconnectReason::new("heartbeat timeout"),
        );
    }
}

// ── Frames ──────────────────────────────────────────────────────────────────

fn run_reader(
    weak: Weak<Shared>,
    generation: u64,
    events: Receiver<TransportEvent>,
    cancel: Receiver<()>,
) {
    loop {
        let event = select! {
            recv(events) -> event => event.ok(),
            recv(cancel) -> _ => return,
        };
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match event {
            Some(TransportEvent::Message(text)) => handle_frame(&shared, generation, &text),
            Some(TransportEvent::Pong) => {
                if let Some(health) = shared.health.lock().as_ref() {
                    health.record_pong();
                }
            }
            Some(TransportEvent::Error(message)) => {
                shared.logger().warn(format_args!("transport error: {message}"));
                notify(
                    &shared,
                    ConnectionNotice::Error {
                        message,
                        recoverable: true,
                    },
                );
            }
            Some(TransportEvent::Closed(reason)) => {
                handle_link_lost(&shared, generation, reason);
                return;
            }
            None => {
                handle_link_lost(
                    &shared,
                    generation,
                    DisconnectReason::with_code("transport dropped", 1006),
                );
                return;
            }
        }
    }
}

fn handle_frame(shared: &Arc<Shared>, generation: u64, text: &str) {
    if let Some(health) = shared.health.lock().as_ref() {
        health.record_activity();
    }

    let (message, raw) = match protocol::decode(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            shared.logger().warn(format_args!("ignoring frame: {e}"));
            return;
        }
    };

    if let Some((event_type, frame)) = message.as_event() {
        let class_name = frame
            .object
            .get("className")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                shared
                    .subscriptions
                    .read()
                    .get(&frame.request_id)
                    .map(|s| s.class_name().to_string())
            })
            .unwrap_or_default();

        let event = Event {
            event_type,
            class_name,
            object_data: frame.object.clone(),
            original_data: frame.original.clone(),
            request_id: frame.request_id,
            received_at: Timestamp::now(),
            raw,
        };
        if !shared.queue().enqueue(event) {
            shared.logger().debug(format_args!(
                "{event_type} event for {} not queued",
                frame.request_id
            ));
        }
        return;
    }

    match message {
        ServerMessage::Connected(body) => {
            if !signal_handshake(shared, generation, Ok(body.client_id)) {
                shared.logger().debug(format_args!("unexpected connected frame"));
            }
        }
        ServerMessage::Subscribed(body) => {
            let subscription = shared.subscriptions.read().get(&body.request_id).cloned();
            match subscription {
                Some(subscription) => {
                    subscription.confirm();
                }
                None => shared.logger().debug(format_args!(
                    "subscribed ack for unknown request {}",
                    body.request_id
                )),
            }
        }
        ServerMessage::Unsubscribed(body) => {
            shared
                .logger()
                .debug(format_args!("server released subscription {}", body.request_id));
        }
        ServerMessage::Error(body) => match body.request_id {
            Some(request_id) => {
                let error = SubscriptionError {
                    request_id,
                    code: body.code,
                    message: body.error,
                    reconnect: body.reconnect,
                };
                shared.logger().warn(format_args!("{error}"));
                let subscription = shared.subscriptions.read().get(&request_id).cloned();
                if let Some(subscription) = subscription {
                    subscription.fail(error);
                }
            }
            None => {
                let message = match body.code {
                    Some(code) => format!("server error {code}: {}", body.error),
                    None => format!("server error: {}", body.error),
                };
                let rejected = signal_handshake(
                    shared,
                    generation,
                    Err(LiveQueryError::Connection(message.clone())),
                );
                if !rejected {
                    shared.logger().warn(format_args!("{message}"));
                    notify(
                        shared,
                        ConnectionNotice::Error {
                            message,
                            recoverable: body.reconnect,
                        },
                    );
                }
            }
        },
        ServerMessage::Unknown => {
            shared.logger().debug(format_args!("ignoring unknown op"));
        }
        _ => {}
    }
}

// ── Outbound ────────────────────────────────────────────────────────────────

fn current_connection(shared: &Shared, generation: Option<u64>) -> Result<Arc<dyn Connection>> {
    let link = shared.link.lock();
    match link.as_ref() {
        Some(link) if generation.map_or(true, |g| g == link.generation) => {
            Ok(Arc::clone(&link.connection))
        }
        _ => Err(LiveQueryError::NotConnected),
    }
}

fn send_message(shared: &Shared, message: &ClientMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    current_connection(shared, None)?.send_text(&text)
}

/// Send a subscription's subscribe message unless it is already out on
/// this connection.
fn send_subscribe(shared: &Shared, subscription: &Subscription) {
    if subscription.is_unsubscribed() || !subscription.claim_send() {
        return;
    }
    if let Err(e) = send_message(shared, &subscription.to_subscribe_message()) {
        subscription.release_send();
        shared.logger().warn(format_args!(
            "failed to send subscribe for {}: {e}",
            subscription.request_id()
        ));
    }
}

fn flush_subscriptions(shared: &Shared) {
    let mut pending: Vec<Arc<Subscription>> =
        shared.subscriptions.read().values().cloned().collect();
    pending.sort_by_key(|s| s.request_id());
    for subscription in pending {
        send_subscribe(shared, &subscription);
    }
}

// ── Disconnects ─────────────────────────────────────────────────────────────

/// Close the current link and stop its heartbeat.
fn teardown_link(shared: &Shared) {
    let link = shared.link.lock().take();
    if let Some(link) = link {
        link.connection.close();
    }
    let health = shared.health.lock().take();
    if let Some(health) = health {
        health.stop();
    }
}

/// Drop unsubscribed entries and mark the rest for re-subscription.
fn reset_subscriptions(shared: &Shared) {
    let mut subs = shared.subscriptions.write();
    subs.retain(|_, sub| !sub.is_unsubscribed());
    for sub in subs.values() {
        sub.reset_for_resubscribe();
    }
}

/// The link for `generation` went away without the caller asking.
fn handle_link_lost(shared: &Arc<Shared>, generation: u64, reason: DisconnectReason) {
    // mid-handshake, connect_once owns the failure
    if signal_handshake(
        shared,
        generation,
        Err(LiveQueryError::Connection(reason.to_string())),
    ) {
        return;
    }

    {
        let mut state = shared.state.lock();
        let current = shared.link.lock().as_ref().map(|l| l.generation);
        if *state != ConnectionState::Connected || current != Some(generation) {
            return;
        }
        *state = ConnectionState::Disconnected;
    }

    shared
        .logger()
        .warn(format_args!("connection lost: {reason}"));
    teardown_link(shared);
    reset_subscriptions(shared);
    notify(shared, ConnectionNotice::Closed(reason));

    if shared.config.read().auto_reconnect {
        schedule_reconnect(shared);
    }
}

fn close_shared(shared: &Arc<Shared>) {
    let was_connected = {
        let mut state = shared.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        let previous = *state;
        *state = ConnectionState::Closed;
        previous == ConnectionState::Connected
    };

    cancel_reconnect(shared);
    signal_handshake_any(shared, Err(LiveQueryError::Closed));
    if was_connected {
        for subscription in shared.subscriptions.read().values() {
            if subscription.was_sent() {
                let _ = send_message(shared, &subscription.to_unsubscribe_message());
            }
        }
    }
    teardown_link(shared);

    shared.queue().stop(true, CLOSE_DRAIN_TIMEOUT);
    let subscriptions: Vec<_> = shared.subscriptions.write().drain().map(|(_, s)| s).collect();
    for subscription in subscriptions {
        subscription.mark_unsubscribed();
    }

    shared.logger().info(format_args!("client closed"));
    if was_connected {
        notify(
            shared,
            ConnectionNotice::Closed(DisconnectReason::with_code("client closed", 1000)),
        );
    }
}

// ── Reconnection ────────────────────────────────────────────────────────────

/// Start the reconnect loop unless one is already running.
fn schedule_reconnect(shared: &Arc<Shared>) {
    let mut reconnect = shared.reconnect.lock();
    if reconnect.active || shared.state() == ConnectionState::Closed {
        return;
    }
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    reconnect.active = true;
    reconnect.cancel = Some(cancel_tx);
    reconnect.run += 1;
    let run = reconnect.run;

    let weak = Arc::downgrade(shared);
    let spawned = thread::Builder::new()
        .name("livequery-reconnect".to_string())
        .spawn(move || run_reconnect(weak, run, cancel_rx));
    if let Err(e) = spawned {
        reconnect.active = false;
        reconnect.cancel = None;
        shared
            .logger()
            .error(format_args!("failed to start reconnect loop: {e}"));
    }
}

fn cancel_reconnect(shared: &Shared) {
    let mut reconnect = shared.reconnect.lock();
    reconnect.cancel = None;
    reconnect.active = false;
    reconnect.run += 1;
}

/// Whether the loop should keep going; checked under the reconnect lock.
fn wants_reconnect(shared: &Shared) -> bool {
    shared.state() == ConnectionState::Disconnected && shared.config.read().auto_reconnect
}

fn run_reconnect(weak: Weak<Shared>, run: u64, cancel: Receiver<()>) {
    loop {
        let delay = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut reconnect = shared.reconnect.lock();
                if reconnect.run != run {
                    return;
                }
                if !wants_reconnect(&shared) {
                    reconnect.active = false;
                    reconnect.cancel = None;
                    return;
                }
            }

            let attempt = shared.reconnect_attempts.load(Ordering::SeqCst);
            let backoff = ReconnectBackoff::from_config(&shared.config.read());
            let delay = backoff.delay_for_attempt(attempt);
            // an open circuit sets a floor on the wait
            let delay = match shared.breaker().time_until_half_open() {
                Some(remaining) => delay.max(remaining),
                None => delay,
            };
            shared.logger().info(format_args!(
                "reconnect attempt {} in {:?}",
                attempt + 1,
                delay
            ));
            delay
        };

        match cancel.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.reconnect.lock().run != run {
            return;
        }
        match connect_once(&shared) {
            Ok(()) => {
                shared.logger().info(format_args!("reconnected"));
            }
            Err(LiveQueryError::Closed) => return,
            Err(LiveQueryError::CircuitOpen { retry_in }) => {
                shared
                    .logger()
                    .debug(format_args!("circuit open; next probe in {retry_in:?}"));
            }
            Err(e) => {
                shared.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                shared.logger().debug(format_args!("reconnect attempt failed: {e}"));
            }
        }
    }
}

// ── Callbacks ───────────────────────────────────────────────────────────────

/// Run every callback registered for the notice's kind. Panics are contained.
fn notify(shared: &Shared, notice: ConnectionNotice) {
    let kind = notice.kind();
    let callbacks: Vec<NoticeCallback> = shared
        .callbacks
        .read()
        .iter()
        .filter(|(event, _)| *event == kind)
        .map(|(_, cb)| Arc::clone(cb))
        .collect();
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(&notice))).is_err() {
            shared
                .logger()
                .error(format_args!("{kind:?} callback panicked"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureStrategy;

    /// Refuses every connect.
    struct Unreachable;

    impl Transport for Unreachable {
        fn connect(
            &self,
            _request: &ConnectRequest,
            _events: Sender<TransportEvent>,
        ) -> Result<Box<dyn Connection>> {
            Err(LiveQueryError::Connection("no route to host".into()))
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new("wss://example.com/live", "app")
            .with_auto_reconnect(false)
            .with_event_queue(8, BackpressureStrategy::Block)
    }

    #[test]
    fn test_notice_kinds() {
        assert_eq!(
            ConnectionNotice::Opened { client_id: None }.kind(),
            ConnectionEvent::Open
        );
        assert_eq!(
            ConnectionNotice::Closed(DisconnectReason::new("x")).kind(),
            ConnectionEvent::Close
        );
        assert_eq!(
            ConnectionNotice::Error {
                message: "x".into(),
                recoverable: false
            }
            .kind(),
            ConnectionEvent::Error
        );
    }

    #[test]
    fn test_failed_connect_reports_error() {
        let client = Client::new(config(), Arc::new(Unreachable)).unwrap();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);
        client.on(ConnectionEvent::Error, move |n| sink.lock().push(n.clone()));

        assert!(matches!(client.connect(), Err(LiveQueryError::Connection(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.circuit_breaker().failure_count(), 1);
        assert_eq!(
            *notices.lock(),
            vec![ConnectionNotice::Error {
                message: "Connection error: no route to host".into(),
                recoverable: false,
            }]
        );
    }

    #[test]
    fn test_subscriptions_kept_while_offline() {
        let client = Client::new(config(), Arc::new(Unreachable)).unwrap();
        let a = client.subscribe("A", serde_json::json!({})).unwrap();
        let b = client.subscribe("B", serde_json::json!({})).unwrap();
        let _ = client.connect();

        let ids: Vec<_> = client.subscriptions().iter().map(|s| s.request_id()).collect();
        assert_eq!(ids, vec![a.request_id(), b.request_id()]);
        assert!(a.is_pending() && b.is_pending());
        assert!(!a.was_sent());

        let diagnostics = client.diagnostics();
        assert_eq!(diagnostics.subscriptions.pending, 2);
        assert!(diagnostics.health.is_none());
        assert_eq!(diagnostics.queue.max_size, 8);
    }
}
