//! Durable record of the last successfully dispatched position.
//!
//! The dispatch loop writes and flushes a checkpoint after each event the
//! application handler accepts; the subscriber reads it once at construction to
//! decide where catch-up resumes.

mod file;

pub use file::FileCheckpoint;

use crate::error::Result;
use crate::types::StreamPosition;
use parking_lot::Mutex;
use std::sync::Arc;

/// Slot name used by checkpoint-file subscriptions.
pub const DEFAULT_CHECKPOINT_SLOT: &str = "lastProcessedPosition";

/// Raw value stored when no event has been processed yet.
pub const NO_CHECKPOINT: i64 = -1;

/// Persistence primitive for the resume position.
pub trait CheckpointStore: Send {
    /// The last durably flushed position, `None` when nothing was processed yet.
    fn read(&self) -> Result<Option<StreamPosition>>;

    /// Record a new position. Not durable until [`flush`](Self::flush).
    fn write(&mut self, position: StreamPosition);

    /// Make the last written position durable.
    fn flush(&mut self) -> Result<()>;
}

/// Convert a raw stored value to a position.
pub(crate) fn decode_raw(raw: i64) -> Option<StreamPosition> {
    u64::try_from(raw).ok().map(StreamPosition)
}

/// Convert a position to its stored value.
pub(crate) fn encode_raw(position: Option<StreamPosition>) -> i64 {
    position.map_or(NO_CHECKPOINT, |p| i64::try_from(p.0).unwrap_or(i64::MAX))
}

#[derive(Debug, Default)]
struct MemorySlot {
    pending: Option<StreamPosition>,
    flushed: Option<StreamPosition>,
    flushes: u64,
}

/// Process-local checkpoint. Clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpoint {
    slot: Arc<Mutex<MemorySlot>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already persisted position.
    pub fn at(position: StreamPosition) -> Self {
        let checkpoint = Self::default();
        {
            let mut slot = checkpoint.slot.lock();
            slot.pending = Some(position);
            slot.flushed = Some(position);
        }
        checkpoint
    }

    /// The last flushed position.
    pub fn position(&self) -> Option<StreamPosition> {
        self.slot.lock().flushed
    }

    /// Number of flushes performed.
    pub fn flush_count(&self) -> u64 {
        self.slot.lock().flushes
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn read(&self) -> Result<Option<StreamPosition>> {
        Ok(self.slot.lock().flushed)
    }

    fn write(&mut self, position: StreamPosition) {
        self.slot.lock().pending = Some(position);
    }

    fn flush(&mut self) -> Result<()> {
        let mut slot = self.slot.lock();
        slot.flushed = slot.pending;
        slot.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_encoding() {
        assert_eq!(decode_raw(NO_CHECKPOINT), None);
        assert_eq!(decode_raw(0), Some(StreamPosition(0)));
        assert_eq!(decode_raw(42), Some(StreamPosition(42)));
        assert_eq!(encode_raw(None), -1);
        assert_eq!(encode_raw(Some(StreamPosition(42))), 42);
    }

    #[test]
    fn test_memory_checkpoint_write_requires_flush() {
        let mut checkpoint = MemoryCheckpoint::new();
        let observer = checkpoint.clone();
        assert_eq!(checkpoint.read().unwrap(), None);

        checkpoint.write(StreamPosition(7));
        assert_eq!(observer.position(), None);

        checkpoint.flush().unwrap();
        assert_eq!(observer.position(), Some(StreamPosition(7)));
        assert_eq!(observer.flush_count(), 1);
    }

    #[test]
    fn test_memory_checkpoint_at() {
        let checkpoint = MemoryCheckpoint::at(StreamPosition(42));
        assert_eq!(checkpoint.read().unwrap(), Some(StreamPosition(42)));
    }
}
