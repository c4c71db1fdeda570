//! Bounded, backpressured event queue with a single consumer thread.
//!
//! The buffer, counters and lifecycle flags live under one mutex. Three
//! condition variables hang off it: `not_empty` wakes the consumer,
//! `not_full` wakes producers blocked under [`BackpressureStrategy::Block`],
//! and `idle` wakes a caller draining the queue in [`EventQueue::stop`].

use crate::config::BackpressureStrategy;
use crate::error::{LiveQueryError, Result};
use crate::logging::Logger;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Why an item was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Oldest queued item evicted to make room (`drop_oldest`).
    Evicted,
    /// Incoming item refused at capacity (`drop_newest`).
    Rejected,
    /// Producer gave up waiting for space (`block`).
    BlockTimeout,
}

/// Hook told about every discarded item.
pub type DropHook<T> = Arc<dyn Fn(&T, DropReason) + Send + Sync>;

/// Read-only snapshot for monitoring.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub strategy: BackpressureStrategy,
    pub running: bool,
    pub in_flight: bool,
    pub enqueued_count: u64,
    pub processed_count: u64,
    pub dropped_count: u64,
    /// Items whose processor returned an error or panicked.
    pub failed_count: u64,
    /// Fraction of capacity in use.
    pub utilization: f64,
}

struct QueueState<T> {
    buffer: VecDeque<T>,
    running: bool,
    /// False once a drain has begun.
    accepting: bool,
    in_flight: bool,
    /// Bumped on every start; a consumer from an earlier run exits on mismatch.
    generation: u64,
    enqueued: u64,
    processed: u64,
    dropped: u64,
    failed: u64,
}

struct Shared<T> {
    max_size: usize,
    strategy: BackpressureStrategy,
    block_timeout: Duration,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    on_drop: RwLock<Option<DropHook<T>>>,
    logger: Logger,
}

impl<T> Shared<T> {
    fn report_drop(&self, item: &T, reason: DropReason) {
        let hook = self.on_drop.read().clone();
        if let Some(hook) = hook {
            hook(item, reason);
        }
    }
}

/// Bounded FIFO feeding one processor thread.
pub struct EventQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> EventQueue<T> {
    /// `block_timeout` bounds how long `enqueue` waits under `block`.
    pub fn new(
        max_size: usize,
        strategy: BackpressureStrategy,
        block_timeout: Duration,
        logger: Logger,
    ) -> Self {
        let max_size = max_size.max(1);
        Self {
            shared: Arc::new(Shared {
                max_size,
                strategy,
                block_timeout,
                state: Mutex::new(QueueState {
                    buffer: VecDeque::with_capacity(max_size),
                    running: false,
                    accepting: false,
                    in_flight: false,
                    generation: 0,
                    enqueued: 0,
                    processed: 0,
                    dropped: 0,
                    failed: 0,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                idle: Condvar::new(),
                on_drop: RwLock::new(None),
                logger: logger.for_component("event_queue"),
            }),
            consumer: Mutex::new(None),
        }
    }

    /// Register the hook told about discarded items.
    pub fn on_drop(&self, hook: impl Fn(&T, DropReason) + Send + Sync + 'static) {
        *self.shared.on_drop.write() = Some(Arc::new(hook));
    }

    /// Start the consumer thread.
    ///
    /// An error from `processor` (or a panic inside it) is logged and counted
    /// as a failure; the consumer moves on to the next item.
    pub fn start<F>(&self, mut processor: F) -> Result<()>
    where
        F: FnMut(T) -> Result<()> + Send + 'static,
    {
        let mut consumer = self.consumer.lock();
        let generation = {
            let mut state = self.shared.state.lock();
            if state.running {
                return Err(LiveQueryError::QueueAlreadyRunning);
            }
            state.running = true;
            state.accepting = true;
            // an item still running on an earlier consumer is not this run's
            state.in_flight = false;
            state.generation += 1;
            state.generation
        };

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("livequery-events".to_string())
            .spawn(move || consume(shared, generation, &mut processor));

        match spawned {
            Ok(handle) => {
                // a consumer left behind by a timed-out drain exits on its own
                *consumer = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.running = false;
                state.accepting = false;
                Err(e.into())
            }
        }
    }

    /// Offer an item. Returns whether it was queued.
    ///
    /// Always false, with counters untouched, while the queue is not running.
    pub fn enqueue(&self, item: T) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.accepting {
            return false;
        }

        if state.buffer.len() >= shared.max_size {
            match shared.strategy {
                BackpressureStrategy::DropNewest => {
                    state.dropped += 1;
                    drop(state);
                    shared.logger.debug(format_args!("queue full; rejecting newest item"));
                    shared.report_drop(&item, DropReason::Rejected);
                    return false;
                }
                BackpressureStrategy::DropOldest => {
                    let evicted = state.buffer.pop_front();
                    state.buffer.push_back(item);
                    state.enqueued += 1;
                    state.dropped += 1;
                    shared.not_empty.notify_one();
                    drop(state);
                    if let Some(evicted) = evicted {
                        shared.logger.debug(format_args!("queue full; evicted oldest item"));
                        shared.report_drop(&evicted, DropReason::Evicted);
                    }
                    return true;
                }
                BackpressureStrategy::Block => {
                    let deadline = Instant::now() + shared.block_timeout;
                    while state.accepting && state.buffer.len() >= shared.max_size {
                        if shared.not_full.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    if !state.accepting {
                        return false;
                    }
                    if state.buffer.len() >= shared.max_size {
                        state.dropped += 1;
                        drop(state);
                        shared.logger.warn(format_args!(
                            "queue full for {:?}; dropping item",
                            shared.block_timeout
                        ));
                        shared.report_drop(&item, DropReason::BlockTimeout);
                        return false;
                    }
                }
            }
        }

        state.buffer.push_back(item);
        state.enqueued += 1;
        shared.not_empty.notify_one();
        true
    }

    /// Stop the consumer.
    ///
    /// With `drain`, new items are refused and the call waits up to `timeout`
    /// for queued items and the in-flight item to finish. Without it, queued
    /// items are abandoned. Returns whether the queue was fully drained.
    /// No-op on a stopped queue.
    pub fn stop(&self, drain: bool, timeout: Duration) -> bool {
        // the processor stopping its own queue cannot wait for itself
        let on_consumer = self
            .consumer
            .lock()
            .as_ref()
            .map(|handle| handle.thread().id() == thread::current().id())
            .unwrap_or(false);

        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.running {
            return true;
        }
        state.accepting = false;
        shared.not_full.notify_all();

        let mut drained = true;
        if drain && !on_consumer {
            let deadline = Instant::now() + timeout;
            while !state.buffer.is_empty() || state.in_flight {
                if shared.idle.wait_until(&mut state, deadline).timed_out() {
                    drained = state.buffer.is_empty() && !state.in_flight;
                    break;
                }
            }
        }

        let abandoned = state.buffer.len();
        state.buffer.clear();
        state.running = false;
        let in_flight = state.in_flight;
        shared.not_empty.notify_all();
        drop(state);

        if abandoned > 0 {
            shared.logger.warn(format_args!("queue stopped with {abandoned} unprocessed items"));
        }

        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            // an in-flight item finishes on its own; the consumer then exits
            if !on_consumer && !in_flight {
                let _ = handle.join();
            }
        }
        drained && abandoned == 0
    }

    /// Discard queued items without processing them. Returns how many.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        let removed = state.buffer.len();
        state.buffer.clear();
        self.shared.not_full.notify_all();
        if !state.in_flight {
            self.shared.idle.notify_all();
        }
        removed
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.shared.state.lock().buffer.len() >= self.shared.max_size
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.shared.strategy
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            size: state.buffer.len(),
            max_size: self.shared.max_size,
            strategy: self.shared.strategy,
            running: state.running,
            in_flight: state.in_flight,
            enqueued_count: state.enqueued,
            processed_count: state.processed,
            dropped_count: state.dropped,
            failed_count: state.failed,
            utilization: state.buffer.len() as f64 / self.shared.max_size as f64,
        }
    }
}

impl<T: Send + 'static> Drop for EventQueue<T> {
    fn drop(&mut self) {
        self.stop(false, Duration::ZERO);
    }
}

fn consume<T, F>(shared: Arc<Shared<T>>, generation: u64, processor: &mut F)
where
    F: FnMut(T) -> Result<()>,
{
    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if state.generation != generation || !state.running {
                    return;
                }
                if let Some(item) = state.buffer.pop_front() {
                    state.in_flight = true;
                    shared.not_full.notify_one();
                    break item;
                }
                shared.not_empty.wait(&mut state);
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| processor(item)));

        let mut state = shared.state.lock();
        if state.generation != generation {
            // restarted while this item ran; the new run owns the flag and counters
            shared
                .logger
                .debug(format_args!("stale consumer finished an abandoned item"));
            return;
        }
        state.in_flight = false;
        match outcome {
            Ok(Ok(())) => state.processed += 1,
            Ok(Err(e)) => {
                state.failed += 1;
                shared.logger.error(format_args!("event processor failed: {e}"));
            }
            Err(_) => {
                state.failed += 1;
                shared.logger.error(format_args!("event processor panicked"));
            }
        }
        if state.buffer.is_empty() {
            shared.idle.notify_all();
        }
    }
}
