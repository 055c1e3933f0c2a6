//! Error types for the stream subscriber.

use std::time::Duration;
use thiserror::Error;

/// Main error type for subscriber operations.
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Heartbeat timeout must be set if heartbeat frequency is set")]
    HeartbeatTimeoutMissing,

    #[error("Heartbeat frequency must be set if heartbeat timeout is set")]
    HeartbeatFrequencyMissing,

    #[error("Heartbeat timeout must be greater than heartbeat frequency (frequency {frequency:?}, timeout {timeout:?})")]
    HeartbeatTimeoutTooShort { frequency: Duration, timeout: Duration },

    #[error("Event source error: {0}")]
    Source(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Intake queue is closed")]
    QueueClosed,

    #[error("Subscriber has been shut down")]
    ShutDown,

    #[error("Checkpoint is locked by another process")]
    Locked,

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl SubscriberError {
    /// True for errors raised while validating construction parameters.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SubscriberError::Configuration(_)
                | SubscriberError::HeartbeatTimeoutMissing
                | SubscriberError::HeartbeatFrequencyMissing
                | SubscriberError::HeartbeatTimeoutTooShort { .. }
        )
    }
}

impl From<serde_json::Error> for SubscriberError {
    fn from(e: serde_json::Error) -> Self {
        SubscriberError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriberError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriberError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriberError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriberError::Deserialization(e.to_string())
    }
}

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;
