//! Circuit breaker guarding reconnect attempts.
//!
//! After `failure_threshold` consecutive failures the circuit opens and
//! refuses attempts until `reset_timeout` has elapsed; the next admission
//! moves it to half-open and is the only one granted until its outcome is
//! recorded. A single success closes the circuit, a single failure re-opens
//! it.

use crate::logging::Logger;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts flow through
    Closed,
    /// Attempts are refused
    Open,
    /// Probing whether the remote recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Callback invoked with `(old_state, new_state)` on every transition.
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Read-only snapshot for monitoring.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitBreakerInfo {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
    /// Seconds since the last recorded failure that opened or refreshed the circuit.
    pub last_failure_secs_ago: Option<f64>,
    pub time_until_half_open_secs: Option<f64>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    /// Half-open admission granted and not yet resolved.
    probe_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }

    /// Move to `next`, returning the transition if the state changed.
    fn transition(&mut self, next: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let previous = self.state;
        if previous == next {
            return None;
        }
        self.state = next;
        self.probe_in_flight = next == CircuitState::HalfOpen;
        if next == CircuitState::Closed {
            self.failure_count = 0;
            self.success_count = 0;
        }
        Some((previous, next))
    }
}

/// Thread-safe circuit breaker.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
    callbacks: RwLock<Vec<StateChangeCallback>>,
    logger: Logger,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, logger: Logger) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: Mutex::new(BreakerState::new()),
            callbacks: RwLock::new(Vec::new()),
            logger: logger.for_component("circuit_breaker"),
        }
    }

    /// Register a transition callback. Callbacks run after the breaker's
    /// lock is released, so they may query the breaker freely.
    pub fn on_state_change(&self, callback: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Whether an attempt may proceed now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and admits the caller as the probe. Further callers are refused until
    /// the probe's outcome is recorded or the probe is released.
    pub fn allow_request(&self) -> bool {
        let (allowed, change) = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => (true, None),
                CircuitState::HalfOpen => {
                    let admitted = !state.probe_in_flight;
                    state.probe_in_flight = true;
                    (admitted, None)
                }
                CircuitState::Open => {
                    if self.reset_elapsed(&state) {
                        (true, state.transition(CircuitState::HalfOpen))
                    } else {
                        (false, None)
                    }
                }
            }
        };
        self.notify(change);
        allowed
    }

    pub fn record_success(&self) {
        let change = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => {
                    state.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    state.transition(CircuitState::Closed)
                }
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    pub fn record_failure(&self) {
        let change = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => {
                    state.failure_count += 1;
                    if state.failure_count >= self.failure_threshold {
                        state.last_failure_at = Some(Instant::now());
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    state.failure_count += 1;
                    state.last_failure_at = Some(Instant::now());
                    state.transition(CircuitState::Open)
                }
                CircuitState::Open => {
                    state.failure_count += 1;
                    state.last_failure_at = Some(Instant::now());
                    None
                }
            }
        };
        self.notify(change);
    }

    /// Give back a half-open admission whose attempt was abandoned without
    /// an outcome, so the next caller may probe instead.
    pub fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.probe_in_flight = false;
        }
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock();
            let change = state.transition(CircuitState::Closed);
            state.failure_count = 0;
            state.success_count = 0;
            state.last_failure_at = None;
            change
        };
        self.notify(change);
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Remaining wait before an open circuit admits a probe; `None` unless open.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let state = self.state.lock();
        Self::remaining(&state, self.reset_timeout)
    }

    pub fn info(&self) -> CircuitBreakerInfo {
        let state = self.state.lock();
        CircuitBreakerInfo {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_threshold: self.failure_threshold,
            reset_timeout_secs: self.reset_timeout.as_secs_f64(),
            last_failure_secs_ago: state.last_failure_at.map(|at| at.elapsed().as_secs_f64()),
            time_until_half_open_secs: Self::remaining(&state, self.reset_timeout)
                .map(|d| d.as_secs_f64()),
        }
    }

    fn reset_elapsed(&self, state: &BreakerState) -> bool {
        match state.last_failure_at {
            Some(at) => at.elapsed() >= self.reset_timeout,
            None => true,
        }
    }

    fn remaining(state: &BreakerState, reset_timeout: Duration) -> Option<Duration> {
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state.last_failure_at.map(|at| at.elapsed()).unwrap_or(reset_timeout);
        Some(reset_timeout.saturating_sub(elapsed))
    }

    // Must be called with the state lock released.
    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };
        match to {
            CircuitState::Open => self.logger.warn(format_args!(
                "circuit opened ({from} -> {to}) after {} failures",
                self.failure_threshold
            )),
            _ => self.logger.info(format_args!("circuit {from} -> {to}")),
        }

        let callbacks: Vec<StateChangeCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("info", &self.info())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(threshold, reset, Logger::disabled())
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, Duration::from_millis(100));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_closed());
        assert!(cb.allow_request());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());
        assert!(cb.time_until_half_open().unwrap() <= Duration::from_millis(100));
    }

    #[test]
    fn test_half_open_probe_and_recovery() {
        let cb = breaker(3, Duration::from_millis(100));
        for _ in 0..3 {
            cb.record_failure();
        }
        thread::sleep(Duration::from_millis(150));

        assert!(cb.allow_request());
        assert!(cb.is_half_open());
        assert!(cb.time_until_half_open().is_none());

        cb.record_success();
        assert!(cb.is_closed());
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.info().success_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(3, Duration::from_millis(100));
        for _ in 0..3 {
            cb.record_failure();
        }
        thread::sleep(Duration::from_millis(150));
        assert!(cb.allow_request());

        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));

        assert!(cb.allow_request());
        assert!(cb.is_half_open());
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        // an abandoned probe hands the slot to the next caller
        cb.release_probe();
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert!(cb.is_closed());
        assert!(cb.allow_request());
        assert!(cb.allow_request());
    }

    #[test]
    fn test_half_open_single_probe_under_contention() {
        let cb = Arc::new(breaker(1, Duration::from_millis(50)));
        cb.record_failure();
        thread::sleep(Duration::from_millis(80));

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    for _ in 0..50 {
                        if cb.allow_request() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert!(cb.is_half_open());
    }

    #[test]
    fn test_success_in_closed_resets_failures() {
        let cb = breaker(3, Duration::from_secs(1));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_closed());
    }

    #[test]
    fn test_reset_from_open() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure();
        assert!(cb.is_open());

        cb.reset();
        assert!(cb.is_closed());
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.allow_request());

        // idempotent
        cb.reset();
        assert!(cb.is_closed());
    }

    #[test]
    fn test_callback_fires_once_per_transition() {
        let cb = breaker(3, Duration::from_millis(50));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        cb.on_state_change(move |from, to| sink.lock().push((from, to)));

        cb.record_failure();
        cb.record_failure();
        assert!(transitions.lock().is_empty());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(
            *transitions.lock(),
            vec![(CircuitState::Closed, CircuitState::Open)]
        );

        thread::sleep(Duration::from_millis(80));
        cb.allow_request();
        cb.allow_request();
        cb.record_success();
        cb.record_success();
        assert_eq!(
            *transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_callback_may_query_breaker() {
        let cb = Arc::new(breaker(1, Duration::from_secs(60)));
        let observed = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&cb);
        let sink = Arc::clone(&observed);
        cb.on_state_change(move |_, _| {
            if let Some(cb) = weak.upgrade() {
                *sink.lock() = Some((cb.state(), cb.info().failure_count));
            }
        });

        cb.record_failure();
        assert_eq!(*observed.lock(), Some((CircuitState::Open, 1)));
    }

    #[test]
    fn test_info_snapshot() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.record_failure();
        let info = cb.info();
        assert_eq!(info.state, CircuitState::Closed);
        assert_eq!(info.failure_count, 1);
        assert_eq!(info.failure_threshold, 2);
        assert!(info.time_until_half_open_secs.is_none());

        cb.record_failure();
        let info = cb.info();
        assert_eq!(info.state, CircuitState::Open);
        assert!(info.last_failure_secs_ago.is_some());
        assert!(info.time_until_half_open_secs.unwrap() > 29.0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "open");
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let cb = Arc::new(breaker(10, Duration::from_secs(60)));
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        cb.on_state_change(move |_, to| {
            if to == CircuitState::Open {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..25 {
                        cb.record_failure();
                        cb.allow_request();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cb.is_open());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_opens_exactly_at_threshold(threshold in 1u32..20, extra in 0u32..5) {
            let cb = breaker(threshold, Duration::from_secs(60));
            for i in 1..threshold {
                cb.record_failure();
                prop_assert!(cb.is_closed(), "opened after {} failures", i);
            }
            for _ in 0..=extra {
                cb.record_failure();
                prop_assert!(cb.is_open());
                prop_assert!(!cb.allow_request());
            }
        }
    }
}
