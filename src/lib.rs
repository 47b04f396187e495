//! Segmented append-only log storage for a Raft consensus server.
//!
//! The log persists an ordered, monotonically indexed sequence of entries on
//! each replica, exposes it to the consensus state machine through commit
//! handles, and reclaims space in the background with minor and major
//! compaction. Storage is organized as immutable segment files with
//! per-segment offset indexes and cleaner bitsets; all rewrites are staged
//! and installed atomically so readers always observe a contiguous cover.
//!
//! ```no_run
//! use raft_seglog::{Entry, EntryKind, Storage, StorageOptions};
//!
//! # fn main() -> raft_seglog::StorageResult<()> {
//! let storage = Storage::new(StorageOptions {
//!     directory: "data/raft".into(),
//!     ..Default::default()
//! })?;
//! let log = storage.open_log("node-1")?;
//! log.append(Entry::new(1, 1, EntryKind::Command, b"set x=1".to_vec()))?;
//! log.flush()?;
//! # Ok(())
//! # }
//! ```

mod cleaner;
mod commit;
mod compaction;
mod config;
mod descriptor;
mod entry;
mod error;
mod log;
mod manager;
mod meta;
mod offset_index;
mod segment;


pub use cleaner::Cleaner;
pub use commit::Commit;
pub use compaction::CompactionStats;
pub use config::{
    Storage, StorageLevel, StorageOptions, DEFAULT_CACHE_ENTRIES, DEFAULT_COMPACTION_THRESHOLD,
    DEFAULT_MAJOR_COMPACTION_INTERVAL, DEFAULT_MAX_ENTRIES_PER_SEGMENT, DEFAULT_MAX_SEGMENT_SIZE,
    DEFAULT_MINOR_COMPACTION_INTERVAL,
};
pub use descriptor::{SegmentDescriptor, DESCRIPTOR_BYTES, DESCRIPTOR_MAGIC};
pub use entry::{BincodeEntryCodec, Entry, EntryCodec, EntryKind};
pub use error::{StorageError, StorageResult};
pub use log::{Log, LogIterator};
pub use manager::DiskStats;
pub use meta::{MetaRecord, MetaStore};
pub use segment::Segment;
