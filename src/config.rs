//! Subscriber configuration.

use crate::error::{Result, SubscriberError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of events read per page during catch-up.
pub const DEFAULT_CATCH_UP_PAGE_SIZE: usize = 1024;

/// Default capacity of the intake queue.
pub const DEFAULT_UPPER_QUEUE_BOUND: usize = 2048;

/// Default number of live events the source may buffer during catch-up.
pub const DEFAULT_MAX_LIVE_QUEUE_SIZE: usize = 10_000;

/// Default period after which a subscriber stuck in catch-up is reported.
pub const DEFAULT_LIVE_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How the subscriber reads the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Only events appended after subscribing, no replay.
    LiveOnly,
    /// Replay history from a position, then switch to live push.
    CatchUp,
}

/// Validated heartbeat parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// How often a heartbeat is sent and liveness is checked.
    pub frequency: Duration,
    /// How long without an observed heartbeat before the subscription restarts.
    pub timeout: Duration,
}

impl HeartbeatSettings {
    pub fn new(frequency: Duration, timeout: Duration) -> Result<Self> {
        if timeout <= frequency {
            return Err(SubscriberError::HeartbeatTimeoutTooShort { frequency, timeout });
        }
        Ok(Self { frequency, timeout })
    }
}

/// Tunables shared by every subscription mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberOptions {
    /// Events per page when reading history.
    /// Default: 1024
    pub catch_up_page_size: usize,

    /// Capacity of the intake queue between the source and the dispatch loop.
    /// Default: 2048
    pub upper_queue_bound: usize,

    /// Live events the source may buffer while catching up.
    /// Default: 10000
    pub max_live_queue_size: usize,

    #[serde(rename = "heartbeat_frequency_ms", with = "optional_millis")]
    pub heartbeat_frequency: Option<Duration>,

    #[serde(rename = "heartbeat_timeout_ms", with = "optional_millis")]
    pub heartbeat_timeout: Option<Duration>,

    /// Default: 10 minutes
    #[serde(rename = "live_processing_timeout_ms", with = "millis")]
    pub live_processing_timeout: Duration,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            catch_up_page_size: DEFAULT_CATCH_UP_PAGE_SIZE,
            upper_queue_bound: DEFAULT_UPPER_QUEUE_BOUND,
            max_live_queue_size: DEFAULT_MAX_LIVE_QUEUE_SIZE,
            heartbeat_frequency: None,
            heartbeat_timeout: None,
            live_processing_timeout: DEFAULT_LIVE_PROCESSING_TIMEOUT,
        }
    }
}

impl SubscriberOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_catch_up_page_size(mut self, size: usize) -> Self {
        self.catch_up_page_size = size;
        self
    }

    pub fn with_upper_queue_bound(mut self, bound: usize) -> Self {
        self.upper_queue_bound = bound;
        self
    }

    pub fn with_max_live_queue_size(mut self, size: usize) -> Self {
        self.max_live_queue_size = size;
        self
    }

    pub fn with_heartbeat(mut self, frequency: Duration, timeout: Duration) -> Self {
        self.heartbeat_frequency = Some(frequency);
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_live_processing_timeout(mut self, timeout: Duration) -> Self {
        self.live_processing_timeout = timeout;
        self
    }

    /// Resolve the heartbeat configuration.
    ///
    /// Heartbeats are enabled only when both frequency and timeout are set.
    pub fn heartbeat(&self) -> Result<Option<HeartbeatSettings>> {
        match (self.heartbeat_frequency, self.heartbeat_timeout) {
            (Some(frequency), Some(timeout)) => HeartbeatSettings::new(frequency, timeout).map(Some),
            (Some(_), None) => Err(SubscriberError::HeartbeatTimeoutMissing),
            (None, Some(_)) => Err(SubscriberError::HeartbeatFrequencyMissing),
            (None, None) => Ok(None),
        }
    }

    /// Check every option, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.upper_queue_bound == 0 {
            return Err(SubscriberError::Configuration(
                "upper_queue_bound must be at least 1".into(),
            ));
        }
        if self.catch_up_page_size == 0 {
            return Err(SubscriberError::Configuration(
                "catch_up_page_size must be at least 1".into(),
            ));
        }
        if self.max_live_queue_size == 0 {
            return Err(SubscriberError::Configuration(
                "max_live_queue_size must be at least 1".into(),
            ));
        }
        if self.live_processing_timeout.is_zero() {
            return Err(SubscriberError::Configuration(
                "live_processing_timeout must be non-zero".into(),
            ));
        }
        self.heartbeat().map(|_| ())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
