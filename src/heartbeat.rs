//! Heartbeat-based liveness detection.
//!
//! A heartbeat is a marker event appended to a private per-instance stream.
//! When the subscribed stream includes it (for example the all-stream), its
//! arrival proves that the append path and the subscription both still work.
//! Every `frequency` the monitor sends one and checks how long ago the last
//! one was observed.

use crate::config::HeartbeatSettings;
use crate::timer::Timer;
use sha2::{Digest, Sha256};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Prefix of every heartbeat stream name.
pub const HEARTBEAT_STREAM_PREFIX: &str = "SubscriberHeartbeat-";

/// Heartbeat streams keep only this many events.
pub const HEARTBEAT_STREAM_MAX_COUNT: u64 = 2;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of a liveness check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// The view is fully caught up; no check needed.
    ViewReady,
    /// A heartbeat was observed within the timeout.
    Healthy,
    /// No heartbeat observed for longer than the timeout.
    TimedOut { elapsed: Duration },
}

/// Decide whether the subscription is stalled.
pub fn evaluate(
    view_ready: bool,
    last_heartbeat: Instant,
    now: Instant,
    timeout: Duration,
) -> HeartbeatStatus {
    if view_ready {
        return HeartbeatStatus::ViewReady;
    }
    let elapsed = now.saturating_duration_since(last_heartbeat);
    if elapsed <= timeout {
        HeartbeatStatus::Healthy
    } else {
        HeartbeatStatus::TimedOut { elapsed }
    }
}

/// Build a heartbeat stream name unique to this subscriber instance.
pub fn instance_stream_name() -> String {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.update(nanos.to_le_bytes());
    hasher.update(INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();
    format!("{}{}", HEARTBEAT_STREAM_PREFIX, hex::encode(&digest[..16]))
}

/// Periodic heartbeat emission for one subscriber.
pub(crate) struct HeartbeatMonitor {
    settings: HeartbeatSettings,
    timer: Timer,
}

impl HeartbeatMonitor {
    pub(crate) fn new(settings: HeartbeatSettings) -> Self {
        Self {
            settings,
            timer: Timer::new("subscriber-heartbeat", settings.frequency),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Begin calling `tick` every heartbeat frequency.
    pub(crate) fn arm<F>(&self, tick: F)
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        self.timer.start(tick);
    }

    pub(crate) fn disarm(&self) {
        self.timer.stop();
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_running()
    }
}
