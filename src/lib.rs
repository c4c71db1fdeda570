//! # Live Query Client
//!
//! A resilient client for a live-query server: subscribe to a class of
//! objects matching a query and receive create/update/delete/enter/leave
//! events as the server pushes them.
//!
//! ## Core Concepts
//!
//! - **Client**: One logical connection, reconnecting with backoff
//! - **Circuit breaker**: Stops retrying a failing endpoint for a while
//! - **Heartbeats**: Ping/pong liveness; a stale link is dropped and redialed
//! - **Event queue**: Bounded buffer with a backpressure strategy between the
//!   socket and your handlers
//! - **Subscriptions**: Per-query handlers, re-sent after every reconnect
//!
//! The socket itself is supplied through the [`Transport`] trait.
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{Client, ClientConfig};
//! use serde_json::json;
//!
//! let config = ClientConfig::new("wss://example.com/live", "my-app")
//!     .with_client_key("key");
//! let client = Client::new(config, transport)?;
//! client.connect()?;
//!
//! let songs = client.subscribe("Song", json!({"artist": "Nina"}))?;
//! songs.on_create(|event| println!("new song: {:?}", event.object_id()));
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod subscription;
pub mod transport;
pub mod types;

// Re-exports
pub use backoff::ReconnectBackoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerInfo, CircuitState};
pub use client::{Client, ClientDiagnostics, ConnectionEvent, ConnectionNotice, SubscriptionCounts};
pub use config::{BackpressureStrategy, ClientConfig, LogLevel, TlsVersion};
pub use error::{LiveQueryError, Result, SubscriptionError};
pub use health::{HealthInfo, HealthMonitor, HeartbeatHooks};
pub use logging::Logger;
pub use queue::{DropReason, EventQueue, QueueStats};
pub use subscription::{Subscription, SubscriptionInfo, SubscriptionState};
pub use transport::{ConnectRequest, Connection, DisconnectReason, Transport, TransportEvent};
pub use types::*;
