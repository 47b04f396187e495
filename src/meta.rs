//! Small durable Raft metadata: term, vote, snapshot markers.
//!
//! The record is fixed-size and rewritten atomically (write temp, fsync,
//! rename) so a crash leaves either the old or the new record, never a torn
//! one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

const META_MAGIC: u32 = 0x4D45_5441;
const META_FORMAT_VERSION: u16 = 1;
const META_BYTES: usize = 48;
const CRC_OFFSET: usize = 40;

/// The persisted tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaRecord {
    pub current_term: u64,
    /// Voted-for node id; `None` when no vote was cast this term.
    pub voted_for: Option<u64>,
    pub last_snapshot_index: u64,
    pub last_snapshot_term: u64,
}

impl MetaRecord {
    fn encode(&self) -> [u8; META_BYTES] {
        let mut buf = [0u8; META_BYTES];
        buf[0..4].copy_from_slice(&META_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&META_FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.current_term.to_le_bytes());
        buf[16..24].copy_from_slice(&self.voted_for.unwrap_or(0).to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_snapshot_index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_snapshot_term.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8], path: &PathBuf) -> StorageResult<Self> {
        if buf.len() < META_BYTES {
            return Err(StorageError::corrupt(path, "metastore file too short"));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != META_MAGIC {
            return Err(StorageError::corrupt(path, "bad metastore magic"));
        }
        let format = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if format != META_FORMAT_VERSION {
            return Err(StorageError::corrupt(
                path,
                format!("unsupported metastore format {}", format),
            ));
        }
        let stored = u32::from_le_bytes(buf[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap());
        if crc32fast::hash(&buf[..CRC_OFFSET]) != stored {
            return Err(StorageError::corrupt(path, "metastore CRC mismatch"));
        }
        let voted_for = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(Self {
            current_term: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            voted_for: if voted_for == 0 { None } else { Some(voted_for) },
            last_snapshot_index: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            last_snapshot_term: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }
}

/// Durable store for one replica's Raft metadata.
pub struct MetaStore {
    path: PathBuf,
    record: Mutex<MetaRecord>,
}

impl MetaStore {
    pub(crate) fn open(path: PathBuf) -> StorageResult<Self> {
        let record = match fs::read(&path) {
            Ok(buf) => MetaRecord::decode(&buf, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MetaRecord::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    /// The current record.
    pub fn load(&self) -> MetaRecord {
        *self.record.lock()
    }

    pub fn current_term(&self) -> u64 {
        self.record.lock().current_term
    }

    pub fn voted_for(&self) -> Option<u64> {
        self.record.lock().voted_for
    }

    pub fn snapshot_marker(&self) -> (u64, u64) {
        let record = self.record.lock();
        (record.last_snapshot_index, record.last_snapshot_term)
    }

    /// Persists a new term and vote.
    pub fn store_term(&self, current_term: u64, voted_for: Option<u64>) -> StorageResult<()> {
        let mut record = self.record.lock();
        record.current_term = current_term;
        record.voted_for = voted_for;
        self.persist(&record)
    }

    /// Persists the marker of the latest state machine snapshot.
    pub fn store_snapshot_marker(&self, index: u64, term: u64) -> StorageResult<()> {
        let mut record = self.record.lock();
        record.last_snapshot_index = index;
        record.last_snapshot_term = term;
        self.persist(&record)
    }

    fn persist(&self, record: &MetaRecord) -> StorageResult<()> {
        let tmp = self.path.with_extension("meta.tmp");
        {
            let mut file: File = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&record.encode())?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, term = record.current_term, "persisted metastore record");
        Ok(())
    }
}
