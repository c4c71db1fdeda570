//! Heartbeat health monitor.
//!
//! While running, a timer thread asks the connection to send a ping every
//! `ping_interval`. A ping left unanswered for `pong_timeout` makes the
//! connection stale, and the stale hook runs once for that episode. Any
//! inbound traffic refreshes activity; only a pong satisfies a ping.

use crate::error::Result;
use crate::logging::Logger;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// What the monitor needs from the connection it watches.
pub trait HeartbeatHooks: Send + Sync {
    /// Send one ping over the connection.
    fn send_ping(&self) -> Result<()>;

    /// The connection missed a pong deadline.
    fn connection_stale(&self);
}

/// Read-only snapshot for monitoring.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthInfo {
    pub running: bool,
    pub healthy: bool,
    pub stale: bool,
    pub awaiting_pong: bool,
    pub uptime_secs: Option<f64>,
    pub seconds_since_activity: Option<f64>,
    pub seconds_since_pong: Option<f64>,
    pub ping_interval_secs: f64,
    pub pong_timeout_secs: f64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub stale_episodes: u64,
}

#[derive(Default)]
struct HealthState {
    running: bool,
    connection_established_at: Option<Instant>,
    last_activity_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    /// When the oldest unanswered ping went out.
    last_ping_at: Option<Instant>,
    awaiting_pong: bool,
    /// Stale hook already ran for the current unanswered ping.
    stale_reported: bool,
    pings_sent: u64,
    pongs_received: u64,
    stale_episodes: u64,
}

impl HealthState {
    fn is_stale(&self, pong_timeout: Duration, now: Instant) -> bool {
        self.running
            && self.awaiting_pong
            && self
                .last_ping_at
                .map(|at| now.duration_since(at) >= pong_timeout)
                .unwrap_or(false)
    }
}

struct Timer {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

struct Shared {
    ping_interval: Duration,
    pong_timeout: Duration,
    state: Mutex<HealthState>,
    logger: Logger,
}

/// Heartbeat monitor for one connection.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    timer: Mutex<Option<Timer>>,
}

impl HealthMonitor {
    pub fn new(ping_interval: Duration, pong_timeout: Duration, logger: Logger) -> Self {
        Self {
            shared: Arc::new(Shared {
                ping_interval,
                pong_timeout,
                state: Mutex::new(HealthState::default()),
                logger: logger.for_component("health"),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Stamp all timestamps and start the ping timer. No-op while running.
    pub fn start(&self, hooks: Arc<dyn HeartbeatHooks>) -> Result<()> {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Ok(());
        }

        {
            let now = Instant::now();
            let mut state = self.shared.state.lock();
            *state = HealthState {
                running: true,
                connection_established_at: Some(now),
                last_activity_at: Some(now),
                last_pong_at: Some(now),
                ..HealthState::default()
            };
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("livequery-heartbeat".to_string())
            .spawn(move || run_timer(shared, hooks, stop_rx));

        match spawned {
            Ok(thread) => {
                *timer = Some(Timer { stop_tx, thread });
                self.shared.logger.debug(format_args!(
                    "heartbeat started (interval {:?}, timeout {:?})",
                    self.shared.ping_interval, self.shared.pong_timeout
                ));
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().running = false;
                Err(e.into())
            }
        }
    }

    /// Cancel the timer. Idempotent; safe to call from a hook.
    pub fn stop(&self) {
        let Some(timer) = self.timer.lock().take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.awaiting_pong = false;
        }
        let _ = timer.stop_tx.try_send(());

        // A hook running on the timer thread cannot join itself.
        let timer_thread: ThreadId = timer.thread.thread().id();
        if timer_thread != thread::current().id() {
            let _ = timer.thread.join();
        }
        self.shared.logger.debug(format_args!("heartbeat stopped"));
    }

    pub fn record_pong(&self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.awaiting_pong = false;
        state.stale_reported = false;
        state.last_ping_at = None;
        state.last_pong_at = Some(now);
        state.last_activity_at = Some(now);
        state.pongs_received += 1;
    }

    pub fn record_activity(&self) {
        self.shared.state.lock().last_activity_at = Some(Instant::now());
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// True only while a ping has gone unanswered past `pong_timeout`.
    pub fn is_stale(&self) -> bool {
        self.shared
            .state
            .lock()
            .is_stale(self.shared.pong_timeout, Instant::now())
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.shared.state.lock();
        state.running && !state.is_stale(self.shared.pong_timeout, Instant::now())
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.shared.state.lock().awaiting_pong
    }

    pub fn seconds_since_activity(&self) -> Option<f64> {
        self.shared
            .state
            .lock()
            .last_activity_at
            .map(|at| at.elapsed().as_secs_f64())
    }

    pub fn seconds_since_pong(&self) -> Option<f64> {
        self.shared
            .state
            .lock()
            .last_pong_at
            .map(|at| at.elapsed().as_secs_f64())
    }

    pub fn health_info(&self) -> HealthInfo {
        let now = Instant::now();
        let state = self.shared.state.lock();
        let stale = state.is_stale(self.shared.pong_timeout, now);
        let since = |at: Option<Instant>| at.map(|at| now.duration_since(at).as_secs_f64());
        HealthInfo {
            running: state.running,
            healthy: state.running && !stale,
            stale,
            awaiting_pong: state.awaiting_pong,
            uptime_secs: since(state.connection_established_at),
            seconds_since_activity: since(state.last_activity_at),
            seconds_since_pong: since(state.last_pong_at),
            ping_interval_secs: self.shared.ping_interval.as_secs_f64(),
            pong_timeout_secs: self.shared.pong_timeout.as_secs_f64(),
            pings_sent: state.pings_sent,
            pongs_received: state.pongs_received,
            stale_episodes: state.stale_episodes,
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(
    shared: Arc<Shared>,
    hooks: Arc<dyn HeartbeatHooks>,
    stop_rx: crossbeam_channel::Receiver<()>,
) {
    let mut next_ping = Instant::now() + shared.ping_interval;

    loop {
        let wake = {
            let state = shared.state.lock();
            if !state.running {
                break;
            }
            match (state.awaiting_pong, state.stale_reported, state.last_ping_at) {
                (true, false, Some(at)) => next_ping.min(at + shared.pong_timeout),
                _ => next_ping,
            }
        };

        let timeout = wake.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let went_stale = {
            let mut state = shared.state.lock();
            if !state.running {
                break;
            }
            if !state.stale_reported && state.is_stale(shared.pong_timeout, now) {
                state.stale_reported = true;
                state.stale_episodes += 1;
                true
            } else {
                false
            }
        };
        if went_stale {
            shared.logger.warn(format_args!(
                "no pong within {:?}; connection is stale",
                shared.pong_timeout
            ));
            hooks.connection_stale();
        }

        if now >= next_ping {
            {
                let mut state = shared.state.lock();
                if !state.running {
                    break;
                }
                // An older unanswered ping keeps its deadline.
                if !state.awaiting_pong {
                    state.awaiting_pong = true;
                    state.last_ping_at = Some(now);
                }
                state.pings_sent += 1;
            }
            if let Err(e) = hooks.send_ping() {
                shared.logger.warn(format_args!("failed to send ping: {e}"));
            }
            next_ping = now + shared.ping_interval;
        }
    }
}
