//! Per-query subscription state machine.
//!
//! A subscription starts `pending`, becomes `subscribed` when the server
//! acknowledges it, `error` when the server rejects it, and `unsubscribed`
//! when torn down. Handlers are kept in tables keyed by event kind; any
//! number of handlers may be registered per kind.
//!
//! # Example
//!
//! ```ignore
//! let sub = Subscription::new("Message").with_where(json!({"room": "lobby"}));
//! sub.on_create(|event| println!("new message: {:?}", event.object_data))
//!    .on_error(|err| eprintln!("rejected: {err}"));
//! let sub = client.subscribe_to(sub)?;
//! ```

use crate::error::{LiveQueryError, Result, SubscriptionError};
use crate::protocol::{ClientMessage, QueryPayload, SubscribeRequest, UnsubscribeRequest};
use crate::types::{Event, EventType, RequestId, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Source of request ids; unique for the life of the process.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Subscription lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Subscribed,
    Unsubscribed,
    Error,
}

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
pub type LifecycleCallback = Arc<dyn Fn(RequestId) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    events: HashMap<EventType, Vec<EventCallback>>,
    error: Vec<ErrorCallback>,
    subscribe: Vec<LifecycleCallback>,
    unsubscribe: Vec<LifecycleCallback>,
}

/// Serializable snapshot of a subscription.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub request_id: RequestId,
    pub class_name: String,
    #[serde(rename = "where")]
    pub where_clause: serde_json::Value,
    pub fields: Option<Vec<String>>,
    pub has_session_token: bool,
    pub state: SubscriptionState,
    pub last_error: Option<String>,
    pub events_received: u64,
    pub created_at: i64,
}

/// One live query.
pub struct Subscription {
    request_id: RequestId,
    class_name: String,
    where_clause: serde_json::Value,
    fields: Option<Vec<String>>,
    session_token: Option<String>,
    created_at: Timestamp,
    state: Mutex<SubscriptionState>,
    last_error: Mutex<Option<SubscriptionError>>,
    /// Subscribe message is on the current connection.
    sent: AtomicBool,
    events_received: AtomicU64,
    callbacks: RwLock<Callbacks>,
}

impl Subscription {
    /// New pending subscription to `class_name` matching everything.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            request_id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            class_name: class_name.into(),
            where_clause: serde_json::Value::Object(Default::default()),
            fields: None,
            session_token: None,
            created_at: Timestamp::now(),
            state: Mutex::new(SubscriptionState::Pending),
            last_error: Mutex::new(None),
            sent: AtomicBool::new(false),
            events_received: AtomicU64::new(0),
            callbacks: RwLock::new(Callbacks::default()),
        }
    }

    /// Constraint map produced by the query layer.
    pub fn with_where(mut self, where_clause: serde_json::Value) -> Self {
        self.where_clause = where_clause;
        self
    }

    /// Restrict delivered objects to these keys.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    // --- Accessors ---

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn where_clause(&self) -> &serde_json::Value {
        &self.where_clause
    }

    pub fn fields(&self) -> Option<&[String]> {
        self.fields.as_deref()
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == SubscriptionState::Pending
    }

    pub fn is_subscribed(&self) -> bool {
        self.state() == SubscriptionState::Subscribed
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.state() == SubscriptionState::Unsubscribed
    }

    pub fn is_error(&self) -> bool {
        self.state() == SubscriptionState::Error
    }

    pub fn last_error(&self) -> Option<SubscriptionError> {
        self.last_error.lock().clone()
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    // --- Handler registration ---

    /// Register a handler for one event kind.
    pub fn on(&self, event_type: EventType, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.callbacks
            .write()
            .events
            .entry(event_type)
            .or_default()
            .push(Arc::new(callback));
        self
    }

    pub fn on_create(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventType::Create, callback)
    }

    pub fn on_update(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventType::Update, callback)
    }

    pub fn on_delete(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventType::Delete, callback)
    }

    pub fn on_enter(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventType::Enter, callback)
    }

    pub fn on_leave(&self, callback: impl Fn(&Event) + Send + Sync + 'static) -> &Self {
        self.on(EventType::Leave, callback)
    }

    pub fn on_error(&self, callback: impl Fn(&SubscriptionError) + Send + Sync + 'static) -> &Self {
        self.callbacks.write().error.push(Arc::new(callback));
        self
    }

    pub fn on_subscribe(&self, callback: impl Fn(RequestId) + Send + Sync + 'static) -> &Self {
        self.callbacks.write().subscribe.push(Arc::new(callback));
        self
    }

    pub fn on_unsubscribe(&self, callback: impl Fn(RequestId) + Send + Sync + 'static) -> &Self {
        self.callbacks.write().unsubscribe.push(Arc::new(callback));
        self
    }

    // --- Wire messages ---

    pub fn to_subscribe_message(&self) -> ClientMessage {
        ClientMessage::Subscribe(SubscribeRequest {
            request_id: self.request_id,
            query: QueryPayload {
                class_name: self.class_name.clone(),
                where_clause: self.where_clause.clone(),
                fields: self.fields.clone(),
            },
            session_token: self.session_token.clone(),
        })
    }

    pub fn to_unsubscribe_message(&self) -> ClientMessage {
        ClientMessage::Unsubscribe(UnsubscribeRequest {
            request_id: self.request_id,
        })
    }

    // --- Transitions ---

    /// Server acknowledged the subscription. Only a pending subscription
    /// transitions; returns whether it did.
    pub fn confirm(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SubscriptionState::Pending {
                return false;
            }
            *state = SubscriptionState::Subscribed;
        }
        *self.last_error.lock() = None;

        let callbacks = self.callbacks.read().subscribe.clone();
        for callback in callbacks {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(self.request_id)));
        }
        true
    }

    /// Server rejected the subscription. Ignored once unsubscribed.
    pub fn fail(&self, error: SubscriptionError) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SubscriptionState::Unsubscribed {
                return false;
            }
            *state = SubscriptionState::Error;
        }
        *self.last_error.lock() = Some(error.clone());

        let callbacks = self.callbacks.read().error.clone();
        for callback in callbacks {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(&error)));
        }
        true
    }

    /// Tear the subscription down. Unsubscribe handlers run once.
    pub fn mark_unsubscribed(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SubscriptionState::Unsubscribed {
                return false;
            }
            *state = SubscriptionState::Unsubscribed;
        }

        let callbacks = self.callbacks.read().unsubscribe.clone();
        for callback in callbacks {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(self.request_id)));
        }
        true
    }

    /// Claim the right to send the subscribe message on the current
    /// connection. Exactly one caller wins until [`Self::reset_for_resubscribe`].
    pub(crate) fn claim_send(&self) -> bool {
        !self.sent.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_send(&self) {
        self.sent.store(false, Ordering::Release);
    }

    pub(crate) fn was_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// The connection dropped: back to pending so the next connection
    /// subscribes again.
    pub(crate) fn reset_for_resubscribe(&self) {
        let mut state = self.state.lock();
        if *state == SubscriptionState::Unsubscribed {
            return;
        }
        *state = SubscriptionState::Pending;
        self.sent.store(false, Ordering::Release);
    }

    // --- Dispatch ---

    /// Run every handler registered for `event`'s kind.
    ///
    /// Events for other subscriptions or kinds without handlers are ignored.
    /// A panicking handler does not stop the others; it is reported as a
    /// processing error once all have run.
    pub fn dispatch(&self, event: &Event) -> Result<usize> {
        if event.request_id != self.request_id || self.is_unsubscribed() {
            return Ok(0);
        }
        self.events_received.fetch_add(1, Ordering::Relaxed);

        let handlers = match self.callbacks.read().events.get(&event.event_type) {
            Some(handlers) => handlers.clone(),
            None => return Ok(0),
        };

        let mut panicked = 0;
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(LiveQueryError::Processing(format!(
                "{panicked} {} handler(s) panicked for subscription {}",
                event.event_type, self.request_id
            )));
        }
        Ok(handlers.len())
    }

    /// Serializable snapshot.
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            request_id: self.request_id,
            class_name: self.class_name.clone(),
            where_clause: self.where_clause.clone(),
            fields: self.fields.clone(),
            has_session_token: self.session_token.is_some(),
            state: self.state(),
            last_error: self.last_error.lock().as_ref().map(|e| e.to_string()),
            events_received: self.events_received(),
            created_at: self.created_at.0,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", &self.request_id)
            .field("class_name", &self.class_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::thread;

    fn event(sub: &Subscription, event_type: EventType) -> Event {
        Event {
            event_type,
            class_name: sub.class_name().to_string(),
            object_data: json!({"objectId": "abc"}),
            original_data: None,
            request_id: sub.request_id(),
            received_at: Timestamp::now(),
            raw: json!({}),
        }
    }

    #[test]
    fn test_request_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    (0..200)
                        .map(|_| Subscription::new("Item").request_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate {id}");
            }
        }
        assert_eq!(seen.len(), 1_600);
    }

    #[test]
    fn test_subscribe_message() {
        let sub = Subscription::new("Game")
            .with_where(json!({"score": {"$gt": 10}}))
            .with_fields(["score", "player"])
            .with_session_token("r:token");
        let json = serde_json::to_value(sub.to_subscribe_message()).unwrap();

        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["requestId"], sub.request_id().0);
        assert_eq!(json["query"]["className"], "Game");
        assert_eq!(json["query"]["where"], json!({"score": {"$gt": 10}}));
        assert_eq!(json["query"]["fields"], json!(["score", "player"]));
        assert_eq!(json["sessionToken"], "r:token");

        let json = serde_json::to_value(sub.to_unsubscribe_message()).unwrap();
        assert_eq!(json, json!({"op": "unsubscribe", "requestId": sub.request_id().0}));
    }

    #[test]
    fn test_minimal_subscribe_message() {
        let sub = Subscription::new("Game");
        let json = serde_json::to_value(sub.to_subscribe_message()).unwrap();
        assert_eq!(json["query"]["where"], json!({}));
        assert!(json["query"].get("fields").is_none());
        assert!(json.get("sessionToken").is_none());
    }

    #[test]
    fn test_confirm_fires_once() {
        let sub = Subscription::new("Game");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        sub.on_subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_pending());
        assert!(sub.confirm());
        assert!(sub.is_subscribed());
        assert!(!sub.confirm());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fail_delivers_typed_error() {
        let sub = Subscription::new("Game");
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        sub.on_error(move |err| *sink.lock() = Some(err.clone()));

        let error = SubscriptionError {
            request_id: sub.request_id(),
            code: Some(119),
            message: "permission denied".into(),
            reconnect: false,
        };
        assert!(sub.fail(error.clone()));
        assert!(sub.is_error());
        assert_eq!(*received.lock(), Some(error.clone()));
        assert_eq!(sub.last_error(), Some(error));
        assert!(sub.info().last_error.unwrap().contains("permission denied"));
    }

    #[test]
    fn test_unsubscribe_is_terminal() {
        let sub = Subscription::new("Game");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        sub.on_unsubscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.mark_unsubscribed());
        assert!(!sub.mark_unsubscribed());
        assert!(!sub.confirm());
        assert!(!sub.fail(SubscriptionError::new(sub.request_id(), "late")));
        sub.reset_for_resubscribe();
        assert!(sub.is_unsubscribed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_by_type() {
        let sub = Subscription::new("Game");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        sub.on_create(move |e| a.lock().push(("create-1", e.event_type)))
            .on_create(move |e| b.lock().push(("create-2", e.event_type)))
            .on_leave(move |e| c.lock().push(("leave", e.event_type)));

        assert_eq!(sub.dispatch(&event(&sub, EventType::Create)).unwrap(), 2);
        assert_eq!(sub.dispatch(&event(&sub, EventType::Update)).unwrap(), 0);
        assert_eq!(sub.dispatch(&event(&sub, EventType::Leave)).unwrap(), 1);

        assert_eq!(
            *log.lock(),
            vec![
                ("create-1", EventType::Create),
                ("create-2", EventType::Create),
                ("leave", EventType::Leave),
            ]
        );
        assert_eq!(sub.events_received(), 3);
    }

    #[test]
    fn test_dispatch_ignores_other_subscriptions() {
        let sub = Subscription::new("Game");
        let other = Subscription::new("Game");
        sub.on_create(|_| panic!("must not run"));
        assert_eq!(sub.dispatch(&event(&other, EventType::Create)).unwrap(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let sub = Subscription::new("Game");
        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        sub.on_delete(|_| panic!("handler bug"))
            .on_delete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let result = sub.dispatch(&event(&sub, EventType::Delete));
        assert!(matches!(result, Err(LiveQueryError::Processing(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_claim_send_once() {
        let sub = Subscription::new("Game");
        assert!(sub.claim_send());
        assert!(!sub.claim_send());
        sub.confirm();
        sub.reset_for_resubscribe();
        assert!(sub.is_pending());
        assert!(sub.claim_send());
    }
}
