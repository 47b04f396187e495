//! Per-entry liveness tracking.
//!
//! The state machine reports entries it no longer needs through
//! [`Cleaner::clean`]; each segment records those marks in a bitset persisted
//! to a `.clean` sidecar. Compaction derives eligibility from the marks:
//! normal kinds become reclaimable by minor compaction immediately, tombstone
//! kinds wait for a major sweep.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bincode::{Decode, Encode};

use crate::error::{StorageError, StorageResult};
use crate::manager::SegmentManager;

const SIDECAR_MAGIC: u32 = 0x434C_4E31;

/// Fixed-meaning bitset over a segment's relative offsets: a set bit means
/// the entry at that offset has been cleaned.
#[derive(Debug, Clone, Default)]
pub(crate) struct CleanBitset {
    words: Vec<u64>,
    len: u32,
    set_count: u32,
}

#[derive(Encode, Decode)]
struct SidecarFile {
    magic: u32,
    len: u32,
    words: Vec<u64>,
}

impl CleanBitset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn set_count(&self) -> u32 {
        self.set_count
    }

    /// Grows the bitset to cover `len` offsets, new bits unset.
    pub fn extend_to(&mut self, len: u32) {
        debug_assert!(len >= self.len);
        self.len = len;
        let words = (len as usize + 63) / 64;
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    /// Shrinks to `len` offsets, clearing any bits beyond.
    pub fn truncate(&mut self, len: u32) {
        if len >= self.len {
            return;
        }
        self.len = len;
        let words = (len as usize + 63) / 64;
        self.words.truncate(words);
        if let Some(last) = self.words.last_mut() {
            let keep = len as usize - (words - 1) * 64;
            if keep < 64 {
                *last &= (1u64 << keep) - 1;
            }
        }
        self.set_count = self.words.iter().map(|w| w.count_ones()).sum();
    }

    /// Sets the bit, returning whether it was newly set. Idempotent.
    pub fn set(&mut self, bit: u32) -> bool {
        debug_assert!(bit < self.len);
        let word = &mut self.words[bit as usize / 64];
        let mask = 1u64 << (bit % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.set_count += 1;
        true
    }

    pub fn get(&self, bit: u32) -> bool {
        if bit >= self.len {
            return false;
        }
        self.words[bit as usize / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let payload = bincode::encode_to_vec(
            SidecarFile {
                magic: SIDECAR_MAGIC,
                len: self.len,
                words: self.words.clone(),
            },
            bincode::config::standard(),
        )?;
        let mut buf = payload;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        fs::write(path, &buf)?;
        Ok(())
    }

    /// Loads the sidecar; `None` when missing or invalid, in which case all
    /// entries are treated as live.
    pub fn load(path: &Path) -> StorageResult<Option<Self>> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if buf.len() < 4 {
            return Ok(None);
        }
        let (payload, crc_bytes) = buf.split_at(buf.len() - 4);
        let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(payload) != stored {
            return Ok(None);
        }
        let decoded: Result<(SidecarFile, usize), _> =
            bincode::decode_from_slice(payload, bincode::config::standard());
        let file = match decoded {
            Ok((file, _)) if file.magic == SIDECAR_MAGIC => file,
            _ => return Ok(None),
        };
        if file.words.len() != (file.len as usize + 63) / 64 {
            return Ok(None);
        }
        let set_count = file.words.iter().map(|w| w.count_ones()).sum();
        Ok(Some(Self {
            words: file.words,
            len: file.len,
            set_count,
        }))
    }
}

/// Log-level liveness façade handed to commit handles.
#[derive(Clone)]
pub struct Cleaner {
    manager: Arc<SegmentManager>,
}

impl Cleaner {
    pub(crate) fn new(manager: Arc<SegmentManager>) -> Self {
        Self { manager }
    }

    /// Marks the entry at `index` as no longer needed by the state machine.
    ///
    /// Idempotent. Fails with `OutOfRange` when `index` lies outside the
    /// log's current window.
    pub fn clean(&self, index: u64) -> StorageResult<()> {
        let segment = self.manager.segment_for(index).ok_or_else(|| {
            let (first, last) = self.manager.index_window();
            StorageError::OutOfRange { index, first, last }
        })?;
        segment.mark_clean(index)
    }
}
