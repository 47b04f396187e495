//! In-memory entry position index for one segment.
//!
//! Maps `relative_offset = index - first_index` to the entry frame's byte
//! position in the segment file. Compaction leaves holes: a slot with no
//! position belongs to an entry that was rewritten away. The index is
//! persisted to a `.index` sidecar so recovery does not require a body scan;
//! a missing or corrupt sidecar is rebuilt from the body.

use std::fs;
use std::path::Path;

use bincode::{Decode, Encode};

use crate::error::StorageResult;

/// Sentinel for a relative offset with no stored entry.
const NO_POSITION: u32 = u32::MAX;

const SIDECAR_MAGIC: u32 = 0x5345_4758;

#[derive(Debug, Clone, Default)]
pub struct OffsetIndex {
    positions: Vec<u32>,
    present: u32,
}

#[derive(Encode, Decode)]
struct SidecarFile {
    magic: u32,
    positions: Vec<u32>,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of relative offsets covered, holes included.
    pub fn covered(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Number of offsets that still map to a stored entry.
    pub fn present(&self) -> u32 {
        self.present
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Records the next relative offset at `position`.
    pub fn push(&mut self, position: u32) {
        debug_assert_ne!(position, NO_POSITION);
        self.positions.push(position);
        self.present += 1;
    }

    /// Covers the next `n` relative offsets without storing entries.
    pub fn skip(&mut self, n: u32) {
        self.positions
            .extend(std::iter::repeat(NO_POSITION).take(n as usize));
    }

    /// File position of the entry at `relative`, if present.
    pub fn position(&self, relative: u32) -> Option<u32> {
        match self.positions.get(relative as usize) {
            Some(&p) if p != NO_POSITION => Some(p),
            _ => None,
        }
    }

    pub fn is_present(&self, relative: u32) -> bool {
        self.position(relative).is_some()
    }

    /// Drops all slots at or beyond `covered`.
    pub fn truncate(&mut self, covered: u32) {
        self.positions.truncate(covered as usize);
        self.present = self.positions.iter().filter(|&&p| p != NO_POSITION).count() as u32;
    }

    /// Serializes the index to its sidecar file. The write is not atomic;
    /// a torn sidecar fails the CRC on load and triggers a rebuild.
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let payload = bincode::encode_to_vec(
            SidecarFile {
                magic: SIDECAR_MAGIC,
                positions: self.positions.clone(),
            },
            bincode::config::standard(),
        )?;
        let mut buf = payload;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        fs::write(path, &buf)?;
        Ok(())
    }

    /// Loads the sidecar, returning `None` when it is missing or fails
    /// validation (the caller rebuilds by scanning the body).
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
        let present = file.positions.iter().filter(|&&p| p != NO_POSITION).count() as u32;
        Ok(Some(Self {
            positions: file.positions,
            present,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn push_and_lookup() {
        let mut index = OffsetIndex::new();
        index.push(64);
        index.push(100);
        index.skip(2);
        index.push(180);

        assert_eq!(index.covered(), 5);
        assert_eq!(index.present(), 3);
        assert_eq!(index.position(0), Some(64));
        assert_eq!(index.position(1), Some(100));
        assert_eq!(index.position(2), None);
        assert_eq!(index.position(3), None);
        assert_eq!(index.position(4), Some(180));
        assert_eq!(index.position(5), None);
    }

    #[test]
    fn truncate_recounts_present() {
        let mut index = OffsetIndex::new();
        index.push(64);
        index.skip(1);
        index.push(128);
        index.truncate(2);
        assert_eq!(index.covered(), 2);
        assert_eq!(index.present(), 1);
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.index");

        let mut index = OffsetIndex::new();
        index.push(64);
        index.skip(3);
        index.push(90);
        index.save(&path).unwrap();

        let loaded = OffsetIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.covered(), 5);
        assert_eq!(loaded.present(), 2);
        assert_eq!(loaded.position(4), Some(90));
    }

    #[test]
    fn missing_sidecar_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(OffsetIndex::load(&dir.path().join("absent.index"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupt_sidecar_is_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.index");
        let mut index = OffsetIndex::new();
        index.push(64);
        index.save(&path).unwrap();

        let mut buf = fs::read(&path).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;
        fs::write(&path, &buf).unwrap();

        assert!(OffsetIndex::load(&path).unwrap().is_none());
    }
}
