//! Write-through checkpoint file.

use super::{decode_raw, encode_raw, CheckpointStore, DEFAULT_CHECKPOINT_SLOT, NO_CHECKPOINT};
use crate::error::{Result, SubscriberError};
use crate::types::StreamPosition;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for checkpoint files.
const CHECKPOINT_MAGIC: &[u8; 4] = b"CKP\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

/// Header size: magic + version + body length.
const HEADER_SIZE: usize = 4 + 1 + 4;

/// Upper bound on an encoded entry; anything larger is corruption.
const MAX_ENTRY_SIZE: usize = 64 * 1024;

/// On-disk body of a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CheckpointEntry {
    slot: String,
    position: i64,
}

/// Checkpoint persisted as a single framed entry in its own file.
///
/// Layout: magic, version, `u32` body length, MessagePack body, CRC32 of the
/// body. The file is exclusively locked while open.
pub struct FileCheckpoint {
    path: PathBuf,
    slot: String,
    file: File,
    pending: i64,
    flushed: i64,
}

impl FileCheckpoint {
    /// Open the checkpoint at `path`, creating it with `initial` if missing.
    pub fn open(path: impl AsRef<Path>, slot: &str, initial: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| SubscriberError::Locked)?;

        let mut checkpoint = Self {
            path,
            slot: slot.to_string(),
            file,
            pending: initial,
            flushed: initial,
        };

        if checkpoint.file.metadata()?.len() == 0 {
            checkpoint.write_entry(initial)?;
        } else {
            let entry = checkpoint.read_entry()?;
            if entry.slot != checkpoint.slot {
                return Err(SubscriberError::InvalidFormat(format!(
                    "checkpoint slot mismatch: expected {}, found {}",
                    checkpoint.slot, entry.slot
                )));
            }
            checkpoint.pending = entry.position;
            checkpoint.flushed = entry.position;
        }

        Ok(checkpoint)
    }

    /// Open with the default slot name and the "no checkpoint" sentinel.
    pub fn open_default(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, DEFAULT_CHECKPOINT_SLOT, NO_CHECKPOINT)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// The last flushed raw value, including the sentinel.
    pub fn raw(&self) -> i64 {
        self.flushed
    }

    fn write_entry(&mut self, position: i64) -> Result<()> {
        let entry = CheckpointEntry {
            slot: self.slot.clone(),
            position,
        };
        let encoded = rmp_serde::to_vec(&entry)?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + encoded.len() + 4);
        frame.extend_from_slice(CHECKPOINT_MAGIC);
        frame.push(CHECKPOINT_VERSION);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&frame)?;
        self.file.set_len(frame.len() as u64)?;
        // fsync for durability
        self.file.sync_all()?;
        Ok(())
    }

    fn read_entry(&mut self) -> Result<CheckpointEntry> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE || &bytes[0..4] != CHECKPOINT_MAGIC {
            return Err(SubscriberError::InvalidFormat("Invalid checkpoint magic".into()));
        }
        if bytes[4] != CHECKPOINT_VERSION {
            return Err(SubscriberError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                bytes[4]
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[5..HEADER_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_SIZE {
            return Err(SubscriberError::Corruption("checkpoint entry too large".into()));
        }
        if bytes.len() < HEADER_SIZE + len + 4 {
            return Err(SubscriberError::Corruption("checkpoint file truncated".into()));
        }

        let encoded = &bytes[HEADER_SIZE..HEADER_SIZE + len];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&bytes[HEADER_SIZE + len..HEADER_SIZE + len + 4]);
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(encoded);
        if stored != computed {
            return Err(SubscriberError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(encoded)?)
    }
}

impl CheckpointStore for FileCheckpoint {
    fn read(&self) -> Result<Option<StreamPosition>> {
        Ok(decode_raw(self.flushed))
    }

    fn write(&mut self, position: StreamPosition) {
        self.pending = encode_raw(Some(position));
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending == self.flushed {
            return Ok(());
        }
        self.write_entry(self.pending)?;
        self.flushed = self.pending;
        Ok(())
    }
}

impl std::fmt::Debug for FileCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCheckpoint")
            .field("path", &self.path)
            .field("slot", &self.slot)
            .field("flushed", &self.flushed)
            .finish()
    }
}
