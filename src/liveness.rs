//! Shared progress and liveness counters.
//!
//! Each field has exactly one writer:
//! - the intake path writes `last_received`, `last_non_live_received` and
//!   `last_heartbeat`
//! - the dispatch loop writes `last_dispatched`, `events_processed` and
//!   `dispatch_failures`
//! - the controller writes `catching_up` and resets catch-up tracking
//!
//! Readers tolerate stale values; they only feed liveness heuristics.

use crate::types::StreamPosition;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// An optional stream position stored in one atomic word.
///
/// Zero encodes "no position"; any other value is `position + 1`.
#[derive(Debug, Default)]
pub(crate) struct AtomicPosition(AtomicU64);

impl AtomicPosition {
    pub(crate) fn new(position: Option<StreamPosition>) -> Self {
        Self(AtomicU64::new(Self::encode(position)))
    }

    pub(crate) fn load(&self) -> Option<StreamPosition> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(StreamPosition(raw - 1)),
        }
    }

    pub(crate) fn store(&self, position: Option<StreamPosition>) {
        self.0.store(Self::encode(position), Ordering::Release);
    }

    fn encode(position: Option<StreamPosition>) -> u64 {
        position.map_or(0, |p| p.0.saturating_add(1))
    }
}

/// Progress of the intake and dispatch sides of a subscriber.
#[derive(Debug)]
pub struct LivenessState {
    catching_up: AtomicBool,
    last_received: AtomicPosition,
    last_non_live_received: AtomicPosition,
    last_dispatched: AtomicPosition,
    last_heartbeat: Mutex<Instant>,
    events_processed: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl LivenessState {
    /// Fresh state. `resume_from` seeds the last received position.
    pub fn new(resume_from: Option<StreamPosition>) -> Self {
        Self {
            catching_up: AtomicBool::new(true),
            last_received: AtomicPosition::new(resume_from),
            last_non_live_received: AtomicPosition::new(None),
            last_dispatched: AtomicPosition::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
            events_processed: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
        }
    }

    pub fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Acquire)
    }

    pub(crate) fn set_catching_up(&self, catching_up: bool) {
        self.catching_up.store(catching_up, Ordering::Release);
    }

    /// Forget everything learned during the previous catch-up.
    pub(crate) fn reset_catch_up(&self) {
        self.last_non_live_received.store(None);
        self.set_catching_up(true);
        self.record_heartbeat(Instant::now());
    }

    pub fn last_received(&self) -> Option<StreamPosition> {
        self.last_received.load()
    }

    pub(crate) fn record_received(&self, position: StreamPosition) {
        self.last_received.store(Some(position));
    }

    pub fn last_non_live_received(&self) -> Option<StreamPosition> {
        self.last_non_live_received.load()
    }

    pub(crate) fn record_non_live_received(&self, position: StreamPosition) {
        self.last_non_live_received.store(Some(position));
    }

    pub fn last_dispatched(&self) -> Option<StreamPosition> {
        self.last_dispatched.load()
    }

    pub(crate) fn record_dispatched(&self, position: StreamPosition) {
        self.last_dispatched.store(Some(position));
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub(crate) fn record_heartbeat(&self, at: Instant) {
        *self.last_heartbeat.lock() = at;
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_failures(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// True once live processing has started and everything received while
    /// catching up has been drained by the dispatch loop.
    pub fn view_models_ready(&self) -> bool {
        !self.is_catching_up() && self.last_dispatched() >= self.last_non_live_received()
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new(None)
    }
}
