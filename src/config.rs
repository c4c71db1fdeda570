//! Client configuration and validation.

use crate::error::{LiveQueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Mask written in place of credentials in snapshots.
const REDACTED: &str = "[REDACTED]";

/// What the event queue does when it is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Producer waits for space, up to `queue_block_timeout`.
    Block,
    /// Oldest queued event is evicted to make room.
    DropOldest,
    /// Incoming event is rejected.
    DropNewest,
}

impl BackpressureStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BackpressureStrategy::Block => "block",
            BackpressureStrategy::DropOldest => "drop_oldest",
            BackpressureStrategy::DropNewest => "drop_newest",
        }
    }
}

impl FromStr for BackpressureStrategy {
    type Err = LiveQueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(BackpressureStrategy::Block),
            "drop_oldest" => Ok(BackpressureStrategy::DropOldest),
            "drop_newest" => Ok(BackpressureStrategy::DropNewest),
            other => Err(LiveQueryError::Config(format!(
                "backpressure_strategy must be one of block, drop_oldest, drop_newest (got {other:?})"
            ))),
        }
    }
}

/// Minimum severity emitted when logging is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LiveQueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(LiveQueryError::Config(format!(
                "log_level must be one of debug, info, warn, error (got {other:?})"
            ))),
        }
    }
}

/// TLS protocol version bound handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "v1")]
    V1_0,
    #[serde(rename = "v1.1")]
    V1_1,
    #[serde(rename = "v1.2")]
    V1_2,
    #[serde(rename = "v1.3")]
    V1_3,
}

impl TlsVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsVersion::V1_0 => "v1",
            TlsVersion::V1_1 => "v1.1",
            TlsVersion::V1_2 => "v1.2",
            TlsVersion::V1_3 => "v1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = LiveQueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1" => Ok(TlsVersion::V1_0),
            "v1.1" => Ok(TlsVersion::V1_1),
            "v1.2" => Ok(TlsVersion::V1_2),
            "v1.3" => Ok(TlsVersion::V1_3),
            other => Err(LiveQueryError::Config(format!(
                "TLS version must be one of v1, v1.1, v1.2, v1.3 (got {other:?})"
            ))),
        }
    }
}

/// Client configuration.
///
/// Build with [`ClientConfig::new`] and the `with_*` setters, then hand it to
/// [`Client::new`](crate::Client::new), which validates it. The client never
/// mutates its configuration except through
/// [`Client::reconfigure`](crate::Client::reconfigure).
#[derive(Clone)]
pub struct ClientConfig {
    /// Live-query endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    pub application_id: String,
    pub client_key: Option<String>,
    pub master_key: Option<String>,
    /// User session sent with the connect handshake.
    pub session_token: Option<String>,

    /// Connect as soon as the client is created.
    /// Default: false
    pub auto_connect: bool,
    /// Reconnect with backoff after an unexpected disconnect.
    /// Default: true
    pub auto_reconnect: bool,

    /// Heartbeat cadence.
    /// Default: 30s
    pub ping_interval: Duration,
    /// How long a ping may go unanswered before the link is stale.
    /// Default: 10s
    pub pong_timeout: Duration,
    /// Deadline for the server to acknowledge the connect handshake.
    /// Default: 10s
    pub connect_timeout: Duration,

    /// Consecutive failures that open the circuit.
    /// Default: 5
    pub circuit_failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    /// Default: 60s
    pub circuit_reset_timeout: Duration,

    /// Default: 1s
    pub initial_reconnect_interval: Duration,
    /// Default: 30s
    pub max_reconnect_interval: Duration,
    /// Default: 1.5
    pub reconnect_multiplier: f64,
    /// Fraction of the interval added as random jitter, in [0, 1].
    /// Default: 0.2
    pub reconnect_jitter: f64,

    /// Max buffered events.
    /// Default: 1000
    pub event_queue_size: usize,
    /// Default: drop_oldest
    pub backpressure_strategy: BackpressureStrategy,
    /// How long a producer waits for space under `block`.
    /// Default: 5s
    pub queue_block_timeout: Duration,

    /// Default: false
    pub logging_enabled: bool,
    /// Default: info
    pub log_level: LogLevel,

    pub tls_min_version: Option<TlsVersion>,
    pub tls_max_version: Option<TlsVersion>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:1337".to_string(),
            application_id: String::new(),
            client_key: None,
            master_key: None,
            session_token: None,
            auto_connect: false,
            auto_reconnect: true,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            circuit_failure_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
            initial_reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            reconnect_multiplier: 1.5,
            reconnect_jitter: 0.2,
            event_queue_size: 1000,
            backpressure_strategy: BackpressureStrategy::DropOldest,
            queue_block_timeout: Duration::from_secs(5),
            logging_enabled: false,
            log_level: LogLevel::Info,
            tls_min_version: None,
            tls_max_version: None,
        }
    }
}

impl ClientConfig {
    /// Configuration for `endpoint` and `application_id` with default tunables.
    pub fn new(endpoint: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            application_id: application_id.into(),
            ..Default::default()
        }
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    pub fn with_master_key(mut self, key: impl Into<String>) -> Self {
        self.master_key = Some(key.into());
        self
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, reset_timeout: Duration) -> Self {
        self.circuit_failure_threshold = failure_threshold;
        self.circuit_reset_timeout = reset_timeout;
        self
    }

    pub fn with_reconnect_backoff(
        mut self,
        initial: Duration,
        max: Duration,
        multiplier: f64,
        jitter: f64,
    ) -> Self {
        self.initial_reconnect_interval = initial;
        self.max_reconnect_interval = max;
        self.reconnect_multiplier = multiplier;
        self.reconnect_jitter = jitter;
        self
    }

    pub fn with_event_queue(mut self, size: usize, strategy: BackpressureStrategy) -> Self {
        self.event_queue_size = size;
        self.backpressure_strategy = strategy;
        self
    }

    pub fn with_queue_block_timeout(mut self, timeout: Duration) -> Self {
        self.queue_block_timeout = timeout;
        self
    }

    pub fn with_logging(mut self, level: LogLevel) -> Self {
        self.logging_enabled = true;
        self.log_level = level;
        self
    }

    pub fn with_tls_versions(mut self, min: Option<TlsVersion>, max: Option<TlsVersion>) -> Self {
        self.tls_min_version = min;
        self.tls_max_version = max;
        self
    }

    /// Check every field; the first violation is reported.
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(invalid(format!(
                "endpoint must be a ws:// or wss:// URL (got {:?})",
                self.endpoint
            )));
        }
        if self.application_id.trim().is_empty() {
            return Err(invalid("application_id is required"));
        }

        let intervals = [
            ("ping_interval", self.ping_interval),
            ("pong_timeout", self.pong_timeout),
            ("connect_timeout", self.connect_timeout),
            ("circuit_reset_timeout", self.circuit_reset_timeout),
            ("initial_reconnect_interval", self.initial_reconnect_interval),
            ("max_reconnect_interval", self.max_reconnect_interval),
            ("queue_block_timeout", self.queue_block_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be positive")));
            }
        }

        if self.circuit_failure_threshold == 0 {
            return Err(invalid("circuit_failure_threshold must be positive"));
        }
        if self.event_queue_size == 0 {
            return Err(invalid("event_queue_size must be positive"));
        }
        if self.max_reconnect_interval < self.initial_reconnect_interval {
            return Err(invalid(
                "max_reconnect_interval must not be less than initial_reconnect_interval",
            ));
        }
        if !self.reconnect_multiplier.is_finite() || self.reconnect_multiplier < 1.0 {
            return Err(invalid("reconnect_multiplier must be a finite value >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(invalid("reconnect_jitter must be within [0.0, 1.0]"));
        }
        if let (Some(min), Some(max)) = (self.tls_min_version, self.tls_max_version) {
            if min > max {
                return Err(invalid(format!(
                    "tls_min_version {} is above tls_max_version {}",
                    min.as_str(),
                    max.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of every tunable with credentials masked.
    pub fn to_redacted(&self) -> serde_json::Value {
        let mask = |v: &Option<String>| v.as_ref().map(|_| REDACTED);
        json!({
            "endpoint": self.endpoint,
            "application_id": REDACTED,
            "client_key": mask(&self.client_key),
            "master_key": mask(&self.master_key),
            "session_token": mask(&self.session_token),
            "auto_connect": self.auto_connect,
            "auto_reconnect": self.auto_reconnect,
            "ping_interval": self.ping_interval.as_secs_f64(),
            "pong_timeout": self.pong_timeout.as_secs_f64(),
            "connect_timeout": self.connect_timeout.as_secs_f64(),
            "circuit_failure_threshold": self.circuit_failure_threshold,
            "circuit_reset_timeout": self.circuit_reset_timeout.as_secs_f64(),
            "initial_reconnect_interval": self.initial_reconnect_interval.as_secs_f64(),
            "max_reconnect_interval": self.max_reconnect_interval.as_secs_f64(),
            "reconnect_multiplier": self.reconnect_multiplier,
            "reconnect_jitter": self.reconnect_jitter,
            "event_queue_size": self.event_queue_size,
            "backpressure_strategy": self.backpressure_strategy.as_str(),
            "queue_block_timeout": self.queue_block_timeout.as_secs_f64(),
            "logging_enabled": self.logging_enabled,
            "log_level": self.log_level.as_str(),
            "tls_min_version": self.tls_min_version.map(TlsVersion::as_str),
            "tls_max_version": self.tls_max_version.map(TlsVersion::as_str),
        })
    }
}

fn invalid(message: impl Into<String>) -> LiveQueryError {
    LiveQueryError::Config(message.into())
}

// Hand-written so credentials never reach a log line.
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("application_id", &REDACTED)
            .field("client_key", &self.client_key.as_ref().map(|_| REDACTED))
            .field("master_key", &self.master_key.as_ref().map(|_| REDACTED))
            .field("session_token", &self.session_token.as_ref().map(|_| REDACTED))
            .field("auto_connect", &self.auto_connect)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("circuit_failure_threshold", &self.circuit_failure_threshold)
            .field("circuit_reset_timeout", &self.circuit_reset_timeout)
            .field("event_queue_size", &self.event_queue_size)
            .field("backpressure_strategy", &self.backpressure_strategy)
            .finish_non_exhaustive()
    }
}
