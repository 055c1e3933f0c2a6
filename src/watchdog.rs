//! Diagnostic timer for subscribers that never finish catching up.

use crate::timer::Timer;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reports a subscription that has not reached live processing within its
/// timeout. It only logs; restarts are left to drops and heartbeat timeouts.
pub(crate) struct LiveProcessingWatchdog {
    timer: Timer,
    stream: String,
    stalls_reported: Arc<AtomicU64>,
}

impl LiveProcessingWatchdog {
    pub(crate) fn new(stream: impl Into<String>, timeout: Duration) -> Self {
        Self {
            timer: Timer::new("subscriber-watchdog", timeout),
            stream: stream.into(),
            stalls_reported: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arm unless already armed. Reports every timeout period until disarmed.
    pub(crate) fn arm(&self) {
        let stream = self.stream.clone();
        let timeout = self.timer.interval();
        let stalls = Arc::clone(&self.stalls_reported);
        self.timer.start(move || {
            stalls.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                stream = %stream,
                timeout_secs = timeout.as_secs(),
                "subscription has not reached live processing within the timeout"
            );
            ControlFlow::Continue(())
        });
    }

    pub(crate) fn disarm(&self) {
        self.timer.stop();
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_running()
    }

    pub(crate) fn stalls_reported(&self) -> u64 {
        self.stalls_reported.load(Ordering::Relaxed)
    }
}
