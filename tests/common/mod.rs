//! Scripted in-memory transport for client tests.

#![allow(dead_code)]

use crossbeam_channel::Sender;
use livequery::{
    BackpressureStrategy, ClientConfig, ConnectRequest, Connection, DisconnectReason, LiveQueryError,
    Result, Transport, TransportEvent,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Config with fast timers, no auto-connect and no auto-reconnect.
pub fn test_config() -> ClientConfig {
    ClientConfig::new("ws://localhost:1337/live", "test-app")
        .with_client_key("client-key")
        .with_auto_reconnect(false)
        .with_connect_timeout(Duration::from_millis(500))
        .with_heartbeat(Duration::from_secs(30), Duration::from_secs(10))
        .with_reconnect_backoff(Duration::from_millis(10), Duration::from_millis(50), 2.0, 0.0)
        .with_event_queue(1000, BackpressureStrategy::DropOldest)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Server-side behavior of the scripted transport.
#[derive(Clone, Debug)]
pub struct Script {
    /// Answer `connect` with `connected`.
    pub accept_handshake: bool,
    /// Answer `connect` with a connection-level error instead.
    pub reject_handshake: Option<String>,
    /// Answer every `subscribe` with `subscribed`.
    pub ack_subscribe: bool,
    /// Answer every ping with a pong.
    pub answer_pings: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            accept_handshake: true,
            reject_handshake: None,
            ack_subscribe: true,
            answer_pings: true,
        }
    }
}

/// One link opened by [`MockTransport`].
pub struct MockLink {
    pub id: usize,
    events: Sender<TransportEvent>,
    script: Script,
    sent: Mutex<Vec<Value>>,
    pings: AtomicUsize,
    closed: AtomicBool,
}

impl MockLink {
    /// Push a server frame.
    pub fn push(&self, frame: Value) {
        let _ = self.events.send(TransportEvent::Message(frame.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message(text.to_string()));
    }

    pub fn push_event(&self, op: &str, request_id: u64, object: Value) {
        self.push(json!({"op": op, "requestId": request_id, "object": object}));
    }

    /// Simulate the server dropping the link.
    pub fn drop_link(&self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed(DisconnectReason::with_code(reason, 1006)));
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn sent_ops(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|frame| frame["op"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Request ids of every subscribe frame sent on this link.
    pub fn subscribed_ids(&self) -> Vec<u64> {
        self.sent()
            .iter()
            .filter(|frame| frame["op"] == "subscribe")
            .filter_map(|frame| frame["requestId"].as_u64())
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockConnection {
    link: Arc<MockLink>,
}

impl Connection for MockConnection {
    fn send_text(&self, text: &str) -> Result<()> {
        if self.link.is_closed() {
            return Err(LiveQueryError::NotConnected);
        }
        let frame: Value = serde_json::from_str(text)?;
        self.link.sent.lock().push(frame.clone());

        let script = &self.link.script;
        match frame["op"].as_str() {
            Some("connect") => {
                if let Some(message) = &script.reject_handshake {
                    self.link.push(json!({"op": "error", "code": 4, "error": message, "reconnect": false}));
                } else if script.accept_handshake {
                    self.link
                        .push(json!({"op": "connected", "clientId": format!("client-{}", self.link.id)}));
                }
            }
            Some("subscribe") if script.ack_subscribe => {
                self.link
                    .push(json!({"op": "subscribed", "requestId": frame["requestId"].clone()}));
            }
            _ => {}
        }
        Ok(())
    }

    fn send_ping(&self) -> Result<()> {
        if self.link.is_closed() {
            return Err(LiveQueryError::NotConnected);
        }
        self.link.pings.fetch_add(1, Ordering::SeqCst);
        if self.link.script.answer_pings {
            let _ = self.link.events.send(TransportEvent::Pong);
        }
        Ok(())
    }

    fn close(&self) {
        self.link.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TransportState {
    attempts: usize,
    fail_next: usize,
    last_request: Option<ConnectRequest>,
    links: Vec<Arc<MockLink>>,
}

/// Transport that opens in-memory links following a [`Script`].
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            state: Mutex::new(TransportState::default()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Connect attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Links successfully opened.
    pub fn links(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&self.state.lock().links[index])
    }

    pub fn last_link(&self) -> Arc<MockLink> {
        let state = self.state.lock();
        Arc::clone(state.links.last().expect("no link opened"))
    }

    pub fn last_request(&self) -> Option<ConnectRequest> {
        self.state.lock().last_request.clone()
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        request: &ConnectRequest,
        events: Sender<TransportEvent>,
    ) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock();
        state.attempts += 1;
        state.last_request = Some(request.clone());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LiveQueryError::Connection("connection refused".into()));
        }

        let link = Arc::new(MockLink {
            id: state.links.len() + 1,
            events,
            script: self.script.lock().clone(),
            sent: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        state.links.push(Arc::clone(&link));
        Ok(Box::new(MockConnection { link }))
    }
}
